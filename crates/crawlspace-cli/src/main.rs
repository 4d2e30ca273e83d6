//! # crawlspace: container state crawler
//!
//! Observes containers from the host by joining their namespaces in
//! short-lived workers, and samples their cgroup CPU and memory counters.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;
mod output;

use clap::Parser;
use tracing_subscriber::filter::{EnvFilter, filter_fn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);
    commands::execute(cli)
}

/// Installs the subscriber. Events are dropped while any thread is
/// attached to a container's namespaces.
fn init_logging(json: bool) {
    let gate = filter_fn(|_| !crawlspace_core::logging::is_suppressed());
    let format = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };
    tracing_subscriber::registry()
        .with(format.with_filter(gate))
        .with(EnvFilter::from_default_env())
        .init();
}
