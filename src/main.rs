use anyhow::{bail, Result};
use catalog_harvest::config::{HarvestConfig, ProviderConfig};
use catalog_harvest::http::ReqwestTransport;
use catalog_harvest::orchestrator::{Orchestrator, RunReport};
use catalog_harvest::output::RunOutcome;
use catalog_harvest::progress::{BarProgress, LogProgress, ProgressSink};
use catalog_harvest::provider::ProviderKind;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Harvests satellite imagery catalogs for an area and date window into CSV,
/// GeoJSON and georectified thumbnails.
#[derive(Parser)]
#[command(name = "catalog-harvest", version)]
struct Cli {
    /// Run configuration (TOML). Without it the built-in template is used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// First day of the window (YYYY-MM-DD).
    #[arg(long)]
    start_date: Option<String>,

    /// Last day of the window, inclusive (YYYY-MM-DD).
    #[arg(long)]
    end_date: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    lat: Option<f64>,

    #[arg(long = "long", allow_negative_numbers = true)]
    lon: Option<f64>,

    /// Search radius in kilometers.
    #[arg(long)]
    range: Option<f64>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Restrict the run to these providers. May be repeated.
    #[arg(long = "provider")]
    providers: Vec<ProviderKind>,

    /// Write the configuration template to this path and exit.
    #[arg(long)]
    write_template: Option<PathBuf>,

    /// Log progress instead of drawing progress bars.
    #[arg(long)]
    no_progress: bool,
}

impl Cli {
    fn into_config(self) -> Result<HarvestConfig> {
        let mut config = match &self.config {
            Some(path) => HarvestConfig::read(path)?,
            None => HarvestConfig::from_template(&HarvestConfig::template())?,
        };
        if let Some(start_date) = self.start_date {
            config.start_date = start_date;
        }
        if let Some(end_date) = self.end_date {
            config.end_date = end_date;
        }
        if let Some(lat) = self.lat {
            config.lat = lat;
        }
        if let Some(lon) = self.lon {
            config.lon = lon;
        }
        if let Some(range) = self.range {
            config.radius_km = range;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if !self.providers.is_empty() {
            for provider in config.providers.iter_mut() {
                provider.enabled = self.providers.contains(&provider.kind);
            }
            for kind in self.providers {
                if !config.providers.iter().any(|p| p.kind == kind) {
                    config.providers.push(ProviderConfig::new(kind));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn summarize(report: &RunReport) {
    match (&report.outcome, &report.error) {
        (Some(RunOutcome::Records { count, dir }), _) => info!(
            "{}: {count} records in {} ({} requests, {} rasters)",
            report.provider,
            dir.display(),
            report.requests,
            report.rasters
        ),
        (Some(RunOutcome::Empty(dir)), _) => {
            info!("{}: no records, see {}", report.provider, dir.display())
        }
        (Some(RunOutcome::Cancelled { count, dir }), _) => warn!(
            "{}: cancelled, {count} records kept in {}",
            report.provider,
            dir.display()
        ),
        (None, Some(e)) => warn!("{}: failed: {e}", report.provider),
        (None, None) => warn!("{}: ended in {:?}", report.provider, report.state),
    }
    for skipped in &report.skipped {
        warn!("{}: {skipped}", report.provider);
    }
    if report.raster_failures > 0 {
        warn!(
            "{}: {} thumbnails could not be georectified",
            report.provider, report.raster_failures
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.write_template {
        HarvestConfig::from_template(&HarvestConfig::template())?.write(path)?;
        info!("template written to {}", path.display());
        return Ok(());
    }

    let no_progress = cli.no_progress;
    let config = cli.into_config()?;
    let transport = Arc::new(ReqwestTransport::new(config.timeout())?);
    let progress: Arc<dyn ProgressSink> = if no_progress {
        Arc::new(LogProgress)
    } else {
        Arc::new(BarProgress::new())
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight requests");
            on_signal.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config, transport, progress, cancel);
    let reports = orchestrator.run_all().await?;
    reports.iter().for_each(summarize);

    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.provider.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("provider runs did not complete: {}", failed.join(", "));
    }
    Ok(())
}
