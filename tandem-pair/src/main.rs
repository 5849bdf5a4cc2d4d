//! Tandem Pair: runs a host and a joiner against each other in-process.
//!
//! `tandem-pair` pairs two whiteboards; `tandem-pair call` places a video
//! call with loopback devices. Set `RUST_LOG=debug` to see every frame.

mod demo;

use log::{error, info};
use tandem_collab::SessionMode;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mode = match std::env::args().nth(1).as_deref() {
        Some("call") => SessionMode::Call,
        _ => SessionMode::Whiteboard,
    };
    info!("Starting Tandem pairing demo ({mode:?})...");

    if let Err(e) = demo::run(mode).await {
        error!("Demo failed: {e}");
        eprintln!("{}", e.status());
        std::process::exit(1);
    }
}
