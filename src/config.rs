//! Run configuration.
//!
//! Every value has a default, so an empty TOML document is a valid configuration:
//!
//! ```toml
//! [harvest]
//! page = "Venezuela"
//! language = "es"
//! iterations = 3
//! failure_policy = { kind = "retry", max_retries = 2 }
//!
//! [pipeline]
//! language = "es"
//! smoothing = 1
//!
//! [pipeline.vandalism]
//! threshold = 0.999
//! cutoff = "2004-08-05T02:30:31"
//! drop = false
//! ```

use std::{fs, path::Path, time::Duration};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::{
    lexicon::{Language, LexiconError},
    paginator::FailurePolicy,
};

/// The export endpoint refuses to return more revisions per request than this.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("invalid config")]
    Toml(#[from] toml::de::Error),
    #[error("smoothing window must be at least 1")]
    InvalidSmoothing,
    #[error("page size must be between 1 and {MAX_PAGE_SIZE}, got {0}")]
    InvalidPageSize(usize),
    #[error("vandalism threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f64),
    #[error("harvest language `{}` differs from pipeline language `{}`", harvest.code(), pipeline.code())]
    LanguageMismatch { harvest: Language, pipeline: Language },
    #[error(transparent)]
    Lexicon(#[from] LexiconError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub harvest: HarvestConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.harvest.validate()?;
        self.pipeline.validate()?;
        if self.harvest.language != self.pipeline.language {
            return Err(ConfigError::LanguageMismatch {
                harvest: self.harvest.language,
                pipeline: self.pipeline.language,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Title of the page whose history is harvested.
    pub page: String,
    pub language: Language,
    /// Revisions requested per batch.
    pub page_size: usize,
    /// Number of batches to fetch.
    pub iterations: usize,
    /// Pause before every request, in milliseconds.
    pub delay_ms: u64,
    /// Resume after this timestamp instead of starting from the oldest revision.
    pub offset: Option<NaiveDateTime>,
    pub failure_policy: FailurePolicy,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page: "Venezuela".to_string(),
            language: Language::default(),
            page_size: MAX_PAGE_SIZE,
            iterations: 1,
            delay_ms: 5000,
            offset: None,
            failure_policy: FailurePolicy::default(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 60,
        }
    }
}

impl HarvestConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidPageSize(self.page_size));
        }
        Ok(())
    }
}

/// Replacement phrases for the language's default terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TermOverrides {
    pub crisis: Option<String>,
    pub inflation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub language: Language,
    pub terms: TermOverrides,
    /// Periods for the trailing percent change of mention counts.
    pub smoothing: usize,
    pub vandalism: VandalismConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            language: Language::default(),
            terms: TermOverrides::default(),
            smoothing: 1,
            vandalism: VandalismConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smoothing == 0 {
            return Err(ConfigError::InvalidSmoothing);
        }
        self.vandalism.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VandalismConfig {
    /// A revision is suspicious if its link count falls by more than this fraction.
    pub threshold: f64,
    /// Revisions at or before this instant are never flagged.
    pub cutoff: NaiveDateTime,
    /// Write `is_vandalized`.
    pub flag: bool,
    /// Remove flagged revisions from the dataset.
    pub drop: bool,
}

/// Revisions before this predate the link markup the heuristic relies on.
pub fn default_vandalism_cutoff() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2004, 8, 5)
        .and_then(|date| date.and_hms_opt(2, 30, 31))
        .unwrap_or_default()
}

impl Default for VandalismConfig {
    fn default() -> Self {
        Self {
            threshold: 0.999,
            cutoff: default_vandalism_cutoff(),
            flag: true,
            drop: false,
        }
    }
}

impl VandalismConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        Ok(())
    }
}
