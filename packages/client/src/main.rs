#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::Arc;

use clap::Parser;
use pulseform_client::{
    DEFAULT_URL,
    controller::ClientController,
    terminal::{Input, parse_input, render},
    ws::WsClient,
};
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    sync::mpsc,
};

#[derive(Parser, Debug)]
#[command(version, about = "Terminal client for the PulseForm server")]
struct Args {
    /// WebSocket URL of the server
    #[arg(long, env = "PULSEFORM_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Log file name, written under `LOG_DIR`
    #[arg(long, default_value = "pulseform_client.log")]
    log_file: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout belongs to the rendered state
    pulseform_logging::init(Some(&args.log_file))?;

    let (client, handle) = WsClient::new(args.url);
    let (event_tx, event_rx) = mpsc::channel(64);

    let client_task = tokio::spawn(async move { client.start(event_tx).await });

    let controller = Arc::new(ClientController::new(handle.clone()));

    let events_task = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run(event_rx).await }
    });

    let render_task = tokio::spawn({
        let mut state_rx = controller.subscribe();
        async move {
            while state_rx.changed().await.is_ok() {
                let state = state_rx.borrow_and_update().clone();
                println!("{}", render(&state));
            }
        }
    });

    println!("Type a message to submit it, /reset to restart progress, /quit to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let result = match parse_input(&line) {
            Input::Quit => break,
            Input::Empty => continue,
            Input::Reset => controller.reset_progress().await,
            Input::Submit(form) => controller.submit(form).await,
        };

        if let Err(e) = result {
            log::debug!("Command failed: {e}");
        }
    }

    handle.close();
    client_task.await??;
    events_task.await?;
    render_task.abort();

    Ok(())
}
