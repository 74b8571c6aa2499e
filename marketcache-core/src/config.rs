//! Cache configuration loaded from TOML.
//!
//! ```toml
//! cache_dir = "/var/cache/marketcache"
//!
//! [max_age]
//! info_hours = 1080
//!
//! [verify]
//! rtol = 1e-4
//!
//! [exchanges.SES]
//! timezone = "Asia/Singapore"
//! open = "09:00:00"
//! close = "17:00:00"
//! ```
//!
//! Configured exchanges are added to the built-in set; a configured code
//! replaces the built-in entry of the same name.

use crate::calendar::exchange::builtin_exchanges;
use crate::calendar::{ExchangeCalendar, ExchangeSpec};
use crate::reconcile::VerifyOptions;
use crate::store::StoreConfig;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Default max-ages for non-series records, in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxAgeConfig {
    pub info_hours: i64,
    pub scalar_hours: i64,
    pub shares_hours: i64,
}

impl Default for MaxAgeConfig {
    fn default() -> Self {
        Self {
            info_hours: 45 * 24,
            scalar_hours: 7 * 24,
            shares_hours: 30 * 24,
        }
    }
}

impl MaxAgeConfig {
    pub fn info(&self) -> Duration {
        Duration::hours(self.info_hours)
    }

    pub fn scalar(&self) -> Duration {
        Duration::hours(self.scalar_hours)
    }

    pub fn shares(&self) -> Duration {
        Duration::hours(self.shares_hours)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub rtol: f64,
    pub vol_rtol: f64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        let defaults = VerifyOptions::default();
        Self {
            rtol: defaults.rtol,
            vol_rtol: defaults.vol_rtol,
        }
    }
}

impl VerifyConfig {
    pub fn options(&self, correct: bool) -> VerifyOptions {
        VerifyOptions {
            rtol: self.rtol,
            vol_rtol: self.vol_rtol,
            correct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_age: MaxAgeConfig,
    pub verify: VerifyConfig,
    pub exchanges: BTreeMap<String, ExchangeSpec>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_age: MaxAgeConfig::default(),
            verify: VerifyConfig::default(),
            exchanges: builtin_exchanges(),
        }
    }
}

/// `<platform cache dir>/marketcache`, or `./.marketcache` when the platform
/// has none.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("marketcache"))
        .unwrap_or_else(|| PathBuf::from(".marketcache"))
}

impl CacheConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: CacheConfig = toml::from_str(content)?;
        // A table that names only some exchanges must not drop the rest.
        for (code, spec) in builtin_exchanges() {
            config.exchanges.entry(code).or_insert(spec);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.verify.rtol < 0.0 || self.verify.vol_rtol < 0.0 {
            return Err(ConfigError::Invalid("verify tolerances must be non-negative".into()));
        }
        let ages = [
            ("info_hours", self.max_age.info_hours),
            ("scalar_hours", self.max_age.scalar_hours),
            ("shares_hours", self.max_age.shares_hours),
        ];
        if let Some((name, _)) = ages.iter().find(|(_, v)| *v < 0) {
            return Err(ConfigError::Invalid(format!("max_age.{name} must be non-negative")));
        }
        for (code, spec) in &self.exchanges {
            if spec.close <= spec.open {
                return Err(ConfigError::Invalid(format!(
                    "exchange {code}: close {} is not after open {}",
                    spec.close, spec.open
                )));
            }
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.cache_dir.clone())
    }

    pub fn calendar(&self) -> ExchangeCalendar {
        ExchangeCalendar::new(self.exchanges.clone())
    }
}
