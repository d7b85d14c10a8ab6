//! Background report publisher: periodically writes the statistics report to
//! a well-known file and removes it on shutdown.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use dmp_target::{DmpStats, PrometheusExporter};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Published report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Tab-indented text report
    Text,
    /// JSON counters
    Json,
    /// Prometheus exposition format
    Prometheus,
}

pub struct StatsPublisher {
    stats: Arc<DmpStats>,
    path: PathBuf,
    format: ReportFormat,
    exporter: PrometheusExporter,
}

impl StatsPublisher {
    pub fn new(stats: Arc<DmpStats>, path: PathBuf, format: ReportFormat) -> Self {
        Self {
            stats,
            path,
            format,
            exporter: PrometheusExporter::default(),
        }
    }

    /// Current report in the configured format
    pub fn render(&self) -> io::Result<String> {
        let snapshot = self.stats.snapshot();
        Ok(match self.format {
            ReportFormat::Text => snapshot.render(),
            ReportFormat::Json => snapshot.to_json().map_err(io::Error::other)?,
            ReportFormat::Prometheus => self.exporter.export(&snapshot),
        })
    }

    /// Write the report; readers never observe a partial file
    pub fn publish(&self) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, self.render()?)?;
        fs::rename(&tmp, &self.path)
    }

    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed report {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove report {}: {e}", self.path.display()),
        }
    }
}

/// Long-running background task: publish every `interval` until `shutdown`
/// flips to true, then remove the report.
pub async fn publish_loop(
    publisher: StatsPublisher,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Publishing statistics to {}", publisher.path.display());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = publisher.publish() {
                    warn!("Failed to publish report to {}: {e}", publisher.path.display());
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    publisher.remove();
}
