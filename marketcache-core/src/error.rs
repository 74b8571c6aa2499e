//! Error taxonomy for the cache engine.
//!
//! Every fallible operation in the crate returns [`CacheError`]. Provider
//! failures are wrapped with the symbol and operation that triggered them so
//! the caller can decide whether to retry.

use crate::provider::ProviderError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cached record for {key}")]
    NotFound { key: String },

    #[error("store corruption at {}: expected {expected}, found {found}", path.display())]
    StoreCorruption {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("provider failed during {operation} for {symbol}: {source}")]
    Provider {
        symbol: String,
        operation: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("consistency error for {symbol} {interval}: {detail}")]
    Consistency {
        symbol: String,
        interval: String,
        detail: String,
    },

    #[error("exchange '{0}' has no calendar mapping; add it under [exchanges] in the config")]
    UnknownExchange(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corruption(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::StoreCorruption {
            path: path.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub(crate) fn provider<'a>(
        symbol: &'a str,
        operation: &'static str,
    ) -> impl FnOnce(ProviderError) -> Self + 'a {
        move |source| Self::Provider {
            symbol: symbol.to_string(),
            operation,
            source,
        }
    }

    /// True when the failure came from the upstream provider rather than the
    /// local store.
    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_message_names_path() {
        let err = CacheError::corruption("/tmp/x/AAPL/info.json", "record envelope", "truncated");
        let msg = err.to_string();
        assert!(msg.contains("AAPL/info.json"));
        assert!(msg.contains("truncated"));
    }

    #[test]
    fn provider_error_keeps_source() {
        let symbol = String::from("MSFT");
        let err = CacheError::provider(&symbol, "fetch_series")(ProviderError::NetworkUnreachable(
            "dns".into(),
        ));
        assert!(err.is_provider());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("MSFT"));
    }
}
