use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub storage: StorageConfig,
    pub ingestion: IngestionConfig,
    pub analytics: AnalyticsConfig,
}

/// Disclosure-site session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Daily security listing; the date is appended as `YYYYMMDD`.
    pub stock_list_url: String,
    pub search_url: String,

    /// Upper bound on every wait for an expected page element.
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,

    pub request_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_retries: u32,
    pub user_agent: String,

    /// Cap on rows taken from the daily security list.
    pub max_securities: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    DuckDb,
    QuestDb,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub db_path: PathBuf,
    pub questdb_url: String,
    pub run_migrations: bool,
}

/// Ingestion configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Holders at or below this percentage are not persisted.
    pub shareholding_threshold: f64,
    /// Securities-with-data accumulated before a bulk append.
    pub buffer_size: usize,
    pub workers: usize,
    pub lookback_days: i64,
    pub descending: bool,
    /// Abort the day on a failed flush instead of logging and moving on.
    pub strict_flush: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub top_participants: usize,
    pub change_threshold: f64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            stock_list_url:
                "https://www3.hkexnews.hk/sdw/search/ccass_stock_list.htm?sortby=stockcode&shareholdingdate="
                    .to_string(),
            search_url: "https://www.hkexnews.hk/sdw/search/searchsdw.aspx".to_string(),
            wait_timeout_secs: 10,
            poll_interval_ms: 500,
            request_delay_ms: 250,
            jitter_ms: 250,
            max_retries: 3,
            user_agent: "ccass-tracker/0.1 (shareholding research)".to_string(),
            max_securities: 2000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::DuckDb,
            db_path: PathBuf::from("data/ccass.duckdb"),
            questdb_url: "host=localhost port=8812 user=admin password=quest dbname=qdb"
                .to_string(),
            run_migrations: true,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            shareholding_threshold: 0.1,
            buffer_size: 50,
            workers: 1,
            lookback_days: 365,
            descending: true,
            strict_flush: false,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            top_participants: 10,
            change_threshold: 0.5,
        }
    }
}

impl ScraperConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("CCASS").separator("__"))
            .build()?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ingestion.shareholding_threshold, 0.1);
        assert_eq!(cfg.ingestion.buffer_size, 50);
        assert_eq!(cfg.scraper.wait_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.analytics.top_participants, 10);
        assert_eq!(cfg.storage.backend, BackendKind::DuckDb);
    }

    #[test]
    fn test_partial_source_falls_back_to_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[ingestion]\nbuffer_size = 5\n[storage]\nbackend = \"questdb\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.ingestion.buffer_size, 5);
        assert_eq!(cfg.ingestion.shareholding_threshold, 0.1);
        assert_eq!(cfg.storage.backend, BackendKind::QuestDb);
        assert_eq!(cfg.scraper.max_securities, 2000);
    }
}
