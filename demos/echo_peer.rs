//! Echo Peer - dispatcher talking to an in-process companion.
//!
//! This example demonstrates:
//! - Starting a dispatcher with the builder pattern
//! - A companion stand-in that answers framed requests over the FIFOs
//! - Fire-and-forget continuations and awaited requests
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=pipeipc=debug cargo run --example echo_peer
//! ```
//!
//! Linux only: the companion opens its request pipe read-write so it never
//! sees EOF while the dispatcher reconnects.

use std::time::Duration;

use pipeipc::protocol::{encode_response, FrameHeader, HEADER_SIZE};
use pipeipc::transport::PipePaths;
use pipeipc::Dispatcher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tracing_subscriber::EnvFilter;

const COMMANDS: [&str; 3] = ["PLUGINS", "TRACKS", "TEMPO"];

/// Answer each command with a canned reply, like the companion would.
async fn companion(paths: PipePaths) -> std::io::Result<()> {
    while !paths.request.exists() || !paths.response.exists() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut requests = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(&paths.request)?;
    let mut responses = loop {
        match pipe::OpenOptions::new().open_sender(&paths.response) {
            Ok(sender) => break sender,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };

    for _ in 0..COMMANDS.len() {
        let mut header = [0u8; HEADER_SIZE];
        requests.read_exact(&mut header).await?;
        let header = FrameHeader::decode(&header)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut command = vec![0u8; header.payload_length];
        requests.read_exact(&mut command).await?;

        let reply: &[u8] = match command.as_slice() {
            b"PLUGINS" => b"1,Foo,#VST3uri",
            b"TRACKS" => b"0,Drums;1,Bass",
            _ => b"",
        };
        let frame = encode_response(header.request_id, reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        responses.write_all(&frame).await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pipeipc=info")),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let dispatcher = Dispatcher::builder()
        .app_name("echo")
        .pipe_dir(dir.path())
        .start();

    let peer = tokio::spawn(companion(PipePaths::for_app(dir.path(), "echo")));
    dispatcher.wait_until_ready().await?;

    // Continuation: runs on the worker once the reply arrives.
    dispatcher.enqueue_with(COMMANDS[0], |payload| {
        println!("plugins: {}", String::from_utf8_lossy(&payload));
    });

    let tracks = dispatcher.request(COMMANDS[1]).await?;
    println!("tracks: {}", String::from_utf8_lossy(&tracks));

    let tempo = dispatcher.request(COMMANDS[2]).await?;
    println!("tempo: {:?}", String::from_utf8_lossy(&tempo));

    peer.await??;
    dispatcher.halt().await;
    Ok(())
}
