//! Drives provider runs from authentication to written output.
//!
//! Each provider run walks `Idle -> Authenticating -> Querying -> Normalizing ->
//! Finalizing -> Done`. A failed authentication or output write ends the run in
//! `Errored`; failures of single date units are recorded and the run carries on.
//! A run interrupted by the cancellation token ends in `Cancelled` and keeps its
//! partial output without the empty-result rename.
use crate::config::{HarvestConfig, ProviderConfig};
use crate::date_window::{DateUnit, DateWindow};
use crate::error::{IngestError, Result};
use crate::geo_area::{self, AreaOfInterest};
use crate::http::Transport;
use crate::normalize::{normalize, NormalizedRecord};
use crate::output::{RecordSink, RunOutcome, SinkMode};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::provider::{ProviderClient, Session};
use crate::retry::RetryPolicy;
use crate::thumbnail;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Authenticating,
    Querying,
    Normalizing,
    Finalizing,
    Done,
    Cancelled,
    Errored,
}

#[derive(Debug)]
pub struct RunReport {
    pub provider: String,
    pub state: RunState,
    pub outcome: Option<RunOutcome>,
    pub records: usize,
    pub duplicates: usize,
    pub requests: u32,
    pub skipped: Vec<IngestError>,
    pub rasters: usize,
    pub raster_failures: usize,
    pub cancelled: bool,
    pub error: Option<IngestError>,
}

impl RunReport {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            state: RunState::Idle,
            outcome: None,
            records: 0,
            duplicates: 0,
            requests: 0,
            skipped: vec![],
            rasters: 0,
            raster_failures: 0,
            cancelled: false,
            error: None,
        }
    }

    fn transition(&mut self, state: RunState) {
        debug!("{}: {:?} -> {:?}", self.provider, self.state, state);
        self.state = state;
    }

    fn fail(mut self, e: IngestError) -> Self {
        if let IngestError::Cancelled = e {
            warn!("{}: cancelled", self.provider);
            self.cancelled = true;
            self.transition(RunState::Cancelled);
            return self;
        }
        error!("{}: run aborted: {e}", self.provider);
        self.transition(RunState::Errored);
        self.error = Some(e);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Identifier-based de-duplication across tiles and date units of one run.
#[derive(Default)]
struct Accumulator {
    seen: HashSet<String>,
    duplicates: usize,
}

impl Accumulator {
    fn admit(&mut self, records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
        let before = records.len();
        let kept: Vec<NormalizedRecord> = records
            .into_iter()
            .filter(|r| match &r.identifier {
                Some(id) => self.seen.insert(id.clone()),
                None => true,
            })
            .collect();
        self.duplicates += before - kept.len();
        kept
    }
}

pub struct Orchestrator<T: Transport> {
    config: HarvestConfig,
    transport: Arc<T>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(
        config: HarvestConfig,
        transport: Arc<T>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport,
            progress,
            cancel,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Runs every enabled provider concurrently. Input errors fail the whole call,
    /// provider failures only their own report.
    pub async fn run_all(&self) -> Result<Vec<RunReport>> {
        let area = geo_area::resolve(self.config.lat, self.config.lon, self.config.radius_km)?;
        let window = DateWindow::parse(&self.config.start_date, &self.config.end_date)?;
        info!(
            "area of interest {} ({}), window {window}",
            area.geohash(),
            area.bbox().to_bbox_string()
        );

        let runs = self
            .config
            .providers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| self.run_provider(p, &area, &window));
        Ok(join_all(runs).await)
    }

    pub async fn run_provider(
        &self,
        provider_config: &ProviderConfig,
        area: &AreaOfInterest,
        window: &DateWindow,
    ) -> RunReport {
        let name = provider_config.kind.name();
        let mut report = RunReport::new(name);

        report.transition(RunState::Authenticating);
        let provider = match provider_config.kind.build(&provider_config.options) {
            Ok(provider) => provider,
            Err(e) => return report.fail(e),
        };
        let span_days = provider_config
            .date_span_days
            .unwrap_or_else(|| provider.date_spec().span_days);
        let thumbnails_wanted = provider_config.download_thumbnails
            && provider.capabilities().supports_thumbnail_download;
        let client = ProviderClient::new(
            provider,
            self.transport.clone(),
            RetryPolicy::new(self.config.retry.clone()),
            provider_config.request_delay(),
            provider_config.page_size(),
            provider_config.max_pages,
        );
        let session = match client
            .authenticate(&provider_config.credentials, &self.cancel)
            .await
        {
            Ok(session) => session,
            Err(e) => return report.fail(e),
        };

        let tiles = match area.sub_tiles(provider_config.sub_tile_depth) {
            Ok(tiles) => tiles,
            Err(e) => return report.fail(e),
        };
        let mut sink = match RecordSink::create(
            &self.config.output_dir,
            name,
            window,
            provider_config.sink_mode,
        ) {
            Ok(sink) => sink,
            Err(e) => return report.fail(e),
        };

        let work: Vec<(usize, DateUnit, AreaOfInterest)> = window
            .units(span_days)
            .into_iter()
            .flat_map(|unit| tiles.iter().map(move |tile| (unit, tile.clone())))
            .enumerate()
            .map(|(index, (unit, tile))| (index, unit, tile))
            .collect();
        self.progress.report(ProgressEvent::RunStarted {
            provider: name.to_string(),
            units: work.len(),
        });

        report.transition(RunState::Querying);
        let collected = match self
            .query_units(&client, &session, work, &mut sink, &mut report)
            .await
        {
            Ok(records) => records,
            Err(e) => return report.fail(e),
        };

        report.transition(RunState::Finalizing);
        if sink.mode() == SinkMode::Batch {
            if let Err(e) = sink.write_all(&collected) {
                return report.fail(e);
            }
        }

        if report.cancelled {
            match sink.abandon() {
                Ok(outcome) => {
                    if let RunOutcome::Cancelled { count, .. } = &outcome {
                        report.records = *count;
                    }
                    report.outcome = Some(outcome);
                }
                Err(e) => return report.fail(e),
            }
            report.transition(RunState::Cancelled);
            return report;
        }

        if thumbnails_wanted && !collected.is_empty() {
            let summary = thumbnail::process_thumbnails(
                client.transport(),
                client.policy(),
                &collected,
                sink.dirs(),
                &self.config.thumbnails.rectify_options(),
                self.config.thumbnail_pool_width,
                &self.cancel,
            )
            .await;
            report.rasters = summary.written.len();
            report.raster_failures = summary.failures.len();
        }

        match sink.finish() {
            Ok(outcome) => {
                if let RunOutcome::Records { count, .. } = &outcome {
                    report.records = *count;
                }
                report.outcome = Some(outcome);
            }
            Err(e) => return report.fail(e),
        }

        self.progress.report(ProgressEvent::RunFinished {
            provider: name.to_string(),
            records: report.records,
        });
        report.transition(RunState::Done);
        report
    }

    /// Fans the (unit, tile) pairs out over the worker pool and collects the
    /// normalized, de-duplicated records in unit order. Append-mode sinks are
    /// written as units complete.
    async fn query_units(
        &self,
        client: &ProviderClient<T>,
        session: &Session,
        work: Vec<(usize, DateUnit, AreaOfInterest)>,
        sink: &mut RecordSink,
        report: &mut RunReport,
    ) -> Result<Vec<NormalizedRecord>> {
        let name = client.provider().name();
        let cancel = &self.cancel;
        let mut accumulator = Accumulator::default();
        let mut by_unit: BTreeMap<usize, Vec<NormalizedRecord>> = BTreeMap::new();

        let mut results = stream::iter(work)
            .map(|(index, unit, tile)| async move {
                let outcome = client.search_all(session, &tile, &unit, cancel).await;
                (index, unit, tile, outcome)
            })
            .buffer_unordered(self.config.worker_pool_width.max(1));

        while let Some((index, unit, tile, outcome)) = results.next().await {
            report.requests += outcome.requests;
            report.cancelled |= outcome.cancelled;
            let label = format!("{unit} {}", tile.geohash());

            if let Some(e) = outcome.error {
                self.progress.report(ProgressEvent::UnitSkipped {
                    provider: name.to_string(),
                    unit: label.clone(),
                    reason: e.to_string(),
                });
                report.skipped.push(e);
            }

            report.transition(RunState::Normalizing);
            let records: Vec<NormalizedRecord> = outcome
                .features
                .iter()
                .map(|raw| normalize(name, raw, client.provider().field_map()))
                .collect();
            self.progress.report(ProgressEvent::UnitFinished {
                provider: name.to_string(),
                unit: label,
                records: records.len(),
            });

            if sink.mode() == SinkMode::Append {
                let fresh = accumulator.admit(records);
                sink.append(&fresh)?;
                by_unit.insert(index, fresh);
            } else {
                by_unit.insert(index, records);
            }
            report.transition(RunState::Querying);
        }

        if report.cancelled {
            warn!("{name}: cancelled, keeping the records gathered so far");
        }

        let collected = match sink.mode() {
            SinkMode::Append => by_unit.into_values().flatten().collect(),
            SinkMode::Batch => accumulator.admit(by_unit.into_values().flatten().collect()),
        };
        report.duplicates = accumulator.duplicates;
        if report.duplicates > 0 {
            info!("{name}: dropped {} duplicate records", report.duplicates);
        }
        Ok(collected)
    }
}
