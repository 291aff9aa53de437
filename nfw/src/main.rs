use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nfw::cli::Cli;

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    use nfw::{netlink::Netlink, Firewall};

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rules = cli.rules();
    let filters = rules.len();
    let firewall = Firewall::new(Netlink::new(), cli.config(Arc::new(rules)));

    // Already reported through the error channel.
    if firewall.start().is_err() {
        return ExitCode::FAILURE;
    }

    info!(filters, queues = ?cli.queues, "firewall started, press Ctrl-C to exit");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "can't listen for Ctrl-C");
    }

    info!("shutting down");
    firewall.stop();

    ExitCode::SUCCESS
}

#[cfg(not(target_os = "linux"))]
fn main() -> ExitCode {
    let _ = Cli::parse();
    tracing_subscriber::fmt().init();
    error!("netfilter queues are only available on Linux");
    ExitCode::FAILURE
}
