use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// No usable session for a provider. Fatal for that provider's run only.
    #[error("authentication failed for {provider}: {reason}")]
    Authentication { provider: String, reason: String },

    #[error("network error after {attempts} attempt(s): {reason}")]
    TransientNetwork { attempts: u32, reason: String },

    #[error("rate limited, gave up after {retries} throttled retries")]
    RateLimited { retries: u32 },

    /// One date unit, page or thumbnail failed irrecoverably.
    #[error("skipped {unit}: {reason}")]
    SkippedUnit { unit: String, reason: String },

    #[error("unable to parse {field}: {value}")]
    Parse { field: String, value: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("raster error: {0}")]
    Raster(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl IngestError {
    pub fn skipped(unit: impl ToString, reason: impl ToString) -> Self {
        Self::SkippedUnit {
            unit: unit.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn auth(provider: impl ToString, reason: impl ToString) -> Self {
        Self::Authentication {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors that abort a whole provider run rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::Io(_) | Self::Csv(_) | Self::Config(_)
        )
    }
}

impl From<image::ImageError> for IngestError {
    fn from(e: image::ImageError) -> Self {
        Self::Raster(e.to_string())
    }
}

impl From<tiff::TiffError> for IngestError {
    fn from(e: tiff::TiffError) -> Self {
        Self::Raster(e.to_string())
    }
}
