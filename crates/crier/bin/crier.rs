use std::{io, process};

use clap::Parser;
use crier::{Broker, BrokerConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Exit code for fatal misconfiguration, as the operator tooling expects.
const EXIT_MISCONFIGURED: i32 = -2;

#[derive(Parser)]
#[command(name = "crier", about = "Topic publish/subscribe broker")]
struct Cli {
    /// Port to bind for both datagram publishers and stream subscribers.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
}

fn main() {
    // Diagnostics go to stderr; stdout carries only the operator contract
    // lines.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            process::exit(EXIT_MISCONFIGURED);
        }
    };

    let broker = match Broker::bind(BrokerConfig::new(cli.port)) {
        Ok(broker) => broker,
        Err(err) => {
            error!("broker failed to start: {err}");
            process::exit(EXIT_MISCONFIGURED);
        }
    };

    if let Err(err) = broker.run() {
        error!("broker terminated: {err}");
        process::exit(EXIT_MISCONFIGURED);
    }
}
