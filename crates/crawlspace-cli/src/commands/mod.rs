//! CLI command definitions and dispatch.

pub mod crawl;
pub mod sample;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use crawlspace_common::config::CrawlerConfig;

/// crawlspace: observe containers from the host.
#[derive(Parser, Debug)]
#[command(name = "crawlspace", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to a JSON configuration file.
    #[arg(long, global = true, env = "CRAWLSPACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl containers once, or repeatedly with --every.
    Crawl(crawl::CrawlArgs),
    /// Sample cgroup CPU and memory without joining any namespace.
    Sample(sample::SampleArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Crawl(args) => crawl::execute(args, config),
        Command::Sample(args) => sample::execute(args, config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CrawlerConfig> {
    let Some(path) = path else {
        return Ok(CrawlerConfig::default());
    };
    let config = CrawlerConfig::load(path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}
