//! Error taxonomy for the ingestion and read paths.
//!
//! Per-security failures (`ScrapeError`, `ParseError`) are contained by the
//! pipeline and downgraded to "no data". Only `StorageError::Schema` and
//! `StorageError::Connect` abort a run.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("element `{selector}` not found within {waited:?}")]
    ElementNotFound { selector: String, waited: Duration },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector `{0}`")]
    Selector(String),

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("invalid number `{0}`")]
    InvalidNumber(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("schema setup failed: {0}")]
    Schema(String),

    #[error("could not connect to {backend}: {reason}")]
    Connect { backend: &'static str, reason: String },

    #[error("append to {table} failed: {reason}")]
    Write { table: &'static str, reason: String },

    #[error(transparent)]
    DuckDb(#[from] duckdb::Error),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}

impl StorageError {
    /// Startup-time failures; nothing can proceed without the base tables.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Schema(_) | Self::Connect { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_startup_failures_are_fatal() {
        assert!(StorageError::Schema("no table".into()).is_fatal());
        assert!(StorageError::Connect { backend: "questdb", reason: "refused".into() }.is_fatal());
        assert!(!StorageError::Write { table: "ccass_holdings", reason: "disk full".into() }.is_fatal());
    }

    #[test]
    fn test_element_not_found_message_names_selector() {
        let e = ScrapeError::ElementNotFound {
            selector: "#btnSearch".into(),
            waited: Duration::from_secs(10),
        };
        assert_eq!(e.to_string(), "element `#btnSearch` not found within 10s");
    }
}
