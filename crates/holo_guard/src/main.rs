//! Binary entrypoint for the `holo-guard` supervision daemon.

use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use holo_guard::{run, GuardArgs};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("holo_guard=info,warn")),
        )
        .init();

    let config = GuardArgs::parse().into_config()?;
    run(config).await
}
