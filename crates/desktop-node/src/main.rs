//! `desklink`: desktop companion for the assistant service.
//!
//! Reports the active window, running apps and periodic screenshots,
//! relays chat between the terminal and the server, runs the server's
//! `screenshot`/`capture_state` commands, and now and then opens a
//! conversation about what is on screen.
//!
//! # Env vars
//!
//! | Variable          | Description                         | Default          |
//! |-------------------|-------------------------------------|------------------|
//! | `DESKLINK_CONFIG` | Config file path                    | `desklink.toml`  |
//! | `DESKLINK_TOKEN`  | Bearer token (see `server.token_env`) | (none)         |
//! | `RUST_LOG`        | Log filter                          | `info`           |
//!
//! # Platform requirements
//!
//! - Linux: `xdotool`, optionally `xprintidle`, and `grim` (Wayland) or
//!   ImageMagick `import` (X11) for screenshots.
//! - macOS: Accessibility/Automation permission for System Events and
//!   Screen Recording permission for `screencapture`.

mod cli;
mod console;
mod platform;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dl_client::DesktopClientBuilder;
use dl_domain::config::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli::load_config(&cli.config)?;

    match &cli.command {
        None => run(config, &cli, false).await,
        Some(Command::Run { no_connect }) => run(config, &cli, *no_connect).await,
        Some(Command::Config(ConfigCommand::Validate)) => {
            if !cli::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => cli::show(&config),
        Some(Command::CheckToken) => {
            if !cli::check_token(&config).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn run(config: Config, cli: &Cli, no_connect: bool) -> anyhow::Result<()> {
    if !cli::validate(&config, &cli.config) {
        anyhow::bail!("refusing to start with an invalid config");
    }

    let client = DesktopClientBuilder::new(config)
        .client_version(env!("CARGO_PKG_VERSION"))
        .capture_source(Arc::new(platform::OsCapture::new()))
        .autoconnect(!no_connect)
        .build()
        .context("building client")?;
    let handle = client.handle();

    let shutdown = CancellationToken::new();

    // Listen for Ctrl-C.
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl-C received, shutting down");
        shutdown_clone.cancel();
    });

    tokio::spawn(console::show_events(handle.subscribe(), shutdown.clone()));
    tokio::spawn(console::read_input(handle.clone(), shutdown.clone()));

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting desklink");
    println!("{}", console::HELP);

    client.run(shutdown).await.context("client exited with error")?;
    tracing::info!("desklink exited cleanly");
    Ok(())
}
