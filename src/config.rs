use crate::error::{IngestError, Result};
use crate::georectify::{BandMode, RectifyOptions};
use crate::output::SinkMode;
use crate::provider::ProviderKind;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml;

const DEFAULT_MAX_PAGES: u32 = 1000;

/// A harvesting run: where, when and from which catalogs.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HarvestConfig {
    pub start_date: String,
    pub end_date: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
    pub output_dir: PathBuf,
    #[serde(default = "default_worker_pool_width")]
    pub worker_pool_width: usize,
    #[serde(default = "default_thumbnail_pool_width")]
    pub thumbnail_pool_width: usize,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: Credentials,
    pub page_size: Option<u32>,
    pub request_delay_ms: Option<u64>,
    pub date_span_days: Option<u32>,
    #[serde(default)]
    pub sub_tile_depth: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub sink_mode: SinkMode,
    #[serde(default)]
    pub download_thumbnails: bool,
    #[serde(default)]
    pub options: ProviderOptions,
}

/// Secrets are either inlined or read from a named environment variable.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
}

/// Provider-specific query knobs. Unset values fall back to each provider's defaults.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ProviderOptions {
    pub search_url: Option<String>,
    pub auth_url: Option<String>,
    pub workspace: Option<String>,
    #[serde(default)]
    pub item_types: Vec<String>,
    #[serde(default)]
    pub product_types: Vec<String>,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub open_data: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub width: u32,
    pub height: u32,
    pub band_mode: BandMode,
    pub output_bands: u16,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            band_mode: BandMode::Intensity,
            output_bands: 2,
        }
    }
}

impl ThumbnailConfig {
    pub fn rectify_options(&self) -> RectifyOptions {
        RectifyOptions {
            width: self.width,
            height: self.height,
            band_mode: self.band_mode,
            output_bands: self.output_bands,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

fn default_worker_pool_width() -> usize {
    4
}

fn default_thumbnail_pool_width() -> usize {
    10
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl HarvestConfig {
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        toml::from_str(&table.to_string())
            .map_err(|e| IngestError::Config(format!("template does not deserialize: {e}")))
    }

    pub fn template() -> toml::Table {
        toml::toml! {
            start_date = "2024-05-01"
            end_date = "2024-05-07"
            lat = 35.6762
            lon = 139.6503
            radius_km = 25.0
            output_dir = "./outputs"
            worker_pool_width = 4
            thumbnail_pool_width = 10
            http_timeout_secs = 30

            [retry]
            max_attempts = 5
            backoff = "exponential"
            base_delay_ms = 500
            max_delay_ms = 30000
            rate_limit_step_ms = 10
            max_rate_limit_retries = 50

            [thumbnails]
            width = 512
            height = 512
            band_mode = "intensity"
            output_bands = 2

            [[providers]]
            kind = "airbus"
            credentials = { api_key_env = "AIRBUS_API_KEY" }
            page_size = 500
            request_delay_ms = 1100
            options = { workspace = "public-pneo" }

            [[providers]]
            kind = "planet"
            credentials = { api_key_env = "PLANET_API_KEY" }
            options = { item_types = ["SkySatCollect"] }

            [[providers]]
            kind = "maxar"
            enabled = false
            credentials = { api_key_env = "MAXAR_API_KEY" }
            options = { collections = ["wv01", "wv02"] }

            [[providers]]
            kind = "skyfi"
            credentials = { api_key_env = "SKYFI_API_KEY" }
            download_thumbnails = true
            options = { product_types = ["SAR"] }

            [[providers]]
            kind = "umbra"
            enabled = false
            credentials = { api_key_env = "UMBRA_API_KEY" }
            sink_mode = "append"
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_width == 0 || self.thumbnail_pool_width == 0 {
            return Err(IngestError::Config(
                "pool widths must be at least 1".to_string(),
            ));
        }
        if self.providers.iter().all(|p| !p.enabled) {
            return Err(IngestError::Config("no provider is enabled".to_string()));
        }
        if !(1..=4).contains(&self.thumbnails.output_bands) {
            return Err(IngestError::Config(format!(
                "thumbnail output_bands must be 1 to 4, got {}",
                self.thumbnails.output_bands
            )));
        }
        for provider in self.providers.iter().filter(|p| p.enabled) {
            if provider.page_size == Some(0) {
                return Err(IngestError::Config(format!(
                    "{}: page_size must be positive",
                    provider.kind
                )));
            }
        }
        Ok(())
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            enabled: true,
            credentials: Credentials::default(),
            page_size: None,
            request_delay_ms: None,
            date_span_days: None,
            sub_tile_depth: 0,
            max_pages: DEFAULT_MAX_PAGES,
            sink_mode: SinkMode::default(),
            download_thumbnails: false,
            options: ProviderOptions::default(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or_else(|| self.kind.default_page_size())
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(
            self.request_delay_ms
                .unwrap_or_else(|| self.kind.default_request_delay_ms()),
        )
    }
}

impl Credentials {
    pub fn inline(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            api_key_env: None,
        }
    }

    /// The inline key wins over the environment variable.
    pub fn resolve(&self) -> Option<String> {
        let key = match (&self.api_key, &self.api_key_env) {
            (Some(key), _) => Some(key.clone()),
            (None, Some(var)) => std::env::var(var).ok(),
            (None, None) => None,
        };
        key.filter(|k| !k.trim().is_empty())
    }
}
