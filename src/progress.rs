use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RunStarted { provider: String, units: usize },
    UnitFinished { provider: String, unit: String, records: usize },
    UnitSkipped { provider: String, unit: String, reason: String },
    RunFinished { provider: String, records: usize },
}

/// Receives run progress from concurrently running providers.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Progress as log lines.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { provider, units } => {
                info!("{provider}: querying {units} units")
            }
            ProgressEvent::UnitFinished {
                provider,
                unit,
                records,
            } => debug!("{provider}: {unit} returned {records} records"),
            ProgressEvent::UnitSkipped {
                provider,
                unit,
                reason,
            } => warn!("{provider}: skipped {unit}: {reason}"),
            ProgressEvent::RunFinished { provider, records } => {
                info!("{provider}: finished with {records} records")
            }
        }
    }
}

/// One terminal progress bar per provider.
pub struct BarProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl BarProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{prefix:>8} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        Self {
            multi: MultiProgress::new(),
            style,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn with_bar(&self, provider: &str, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(provider) {
                f(bar);
            }
        }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { provider, units } => {
                let bar = self.multi.add(ProgressBar::new(units as u64));
                bar.set_style(self.style.clone());
                bar.set_prefix(provider.clone());
                if let Ok(mut bars) = self.bars.lock() {
                    bars.insert(provider, bar);
                }
            }
            ProgressEvent::UnitFinished {
                provider, unit, ..
            } => self.with_bar(&provider, |bar| {
                bar.set_message(unit);
                bar.inc(1);
            }),
            ProgressEvent::UnitSkipped {
                provider,
                unit,
                reason,
            } => self.with_bar(&provider, |bar| {
                bar.println(format!("{provider}: skipped {unit}: {reason}"));
            }),
            ProgressEvent::RunFinished { provider, records } => self.with_bar(&provider, |bar| {
                bar.finish_with_message(format!("{records} records"));
            }),
        }
    }
}
