//! `crawlspace crawl`: Collect features from containers.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use crawlspace_common::config::{CrawlerConfig, Feature};
use crawlspace_common::types::{CrawlTarget, NamespaceKind};
use crawlspace_runtime::crawler::{CrawlCycle, Crawler};

/// Arguments for the `crawl` command.
#[derive(Args, Debug)]
pub struct CrawlArgs {
    /// Container to crawl, as `<container_id>:<pid>`. Repeatable.
    #[arg(short, long = "target", required = true)]
    pub targets: Vec<CrawlTarget>,

    /// Repeat the crawl every N seconds until Ctrl+C.
    #[arg(long, value_name = "SECS")]
    pub every: Option<u64>,

    /// Bound on each isolated call, in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Namespaces to join, comma separated (e.g. `mnt,uts,pid`).
    #[arg(long, value_delimiter = ',')]
    pub namespaces: Option<Vec<NamespaceKind>>,

    /// Features to collect. Repeatable or comma separated.
    #[arg(long = "feature", value_delimiter = ',')]
    pub features: Option<Vec<Feature>>,

    /// Pretty-print the JSON report.
    #[arg(long)]
    pub pretty: bool,
}

impl CrawlArgs {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, mut config: CrawlerConfig) -> CrawlerConfig {
        if let Some(secs) = self.timeout {
            config.isolation_timeout_secs = secs;
        }
        if let Some(namespaces) = &self.namespaces {
            config.namespaces.clone_from(namespaces);
        }
        if let Some(features) = &self.features {
            config.features.clone_from(features);
        }
        config
    }
}

/// Executes the `crawl` command.
///
/// Prints one JSON document per cycle on stdout.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or stdout cannot be
/// written. Per-container failures are part of the report, not errors.
pub fn execute(args: CrawlArgs, config: CrawlerConfig) -> anyhow::Result<()> {
    let config = args.apply(config);
    let crawler = Crawler::from_config(config).map_err(|e| anyhow::anyhow!("{e}"))?;

    let Some(every) = args.every else {
        return emit(&crawler.crawl(&args.targets), args.pretty);
    };
    if every == 0 {
        anyhow::bail!("--every must be positive");
    }
    let period = Duration::from_secs(every);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        emit(&crawler.crawl(&args.targets), args.pretty)?;
        let next = started + period;
        while running.load(Ordering::SeqCst) && Instant::now() < next {
            std::thread::sleep(Duration::from_millis(250));
        }
    }
    tracing::info!("crawl loop stopped");
    Ok(())
}

fn emit(cycle: &CrawlCycle, pretty: bool) -> anyhow::Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(cycle)?
    } else {
        serde_json::to_string(cycle)?
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}")?;
    stdout.flush()?;
    Ok(())
}
