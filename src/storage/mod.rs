//! Durable store for disclosure records and the security-name map.
//!
//! Two engines sit behind [`StorageBackend`]: embedded DuckDB and a networked
//! QuestDB reached over the Postgres wire protocol. Their SQL dialects differ;
//! callers only ever see [`StorageGateway`], which owns the backend behind a
//! single mutex so every read, write and DDL statement is serialized.

pub mod duckdb_backend;
pub mod questdb_backend;

use crate::config::{BackendKind, StorageConfig};
use crate::error::StorageError;
use crate::models::{DisclosureRecord, ListedSecurity, SecurityNameRecord, TrendRow};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::info;

pub use self::duckdb_backend::DuckDbBackend;
pub use self::questdb_backend::QuestDbBackend;

pub const HOLDINGS_TABLE: &str = "ccass_holdings";
pub const STOCK_MAP_TABLE: &str = "stock_map";

/// Rows for one bulk append, tagged with their destination table.
#[derive(Debug, Clone, Copy)]
pub enum RowBatch<'a> {
    Disclosures(&'a [DisclosureRecord]),
    SecurityNames(&'a [SecurityNameRecord]),
}

impl RowBatch<'_> {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Disclosures(_) => HOLDINGS_TABLE,
            Self::SecurityNames(_) => STOCK_MAP_TABLE,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Disclosures(rows) => rows.len(),
            Self::SecurityNames(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Backend contract ──────────────────────────────────────────────────────────

/// One storage engine. Both implementations must return identical logical
/// results for the same call.
#[async_trait]
pub trait StorageBackend: Send {
    fn name(&self) -> &'static str;

    async fn ensure_schema(&mut self) -> Result<(), StorageError>;
    async fn ensure_indexes(&mut self) -> Result<(), StorageError>;

    /// Append in order within one commit; all rows become visible or none.
    async fn append_rows(&mut self, batch: RowBatch<'_>) -> Result<usize, StorageError>;

    async fn scraped_stock_codes(&mut self, date: NaiveDate) -> Result<HashSet<String>, StorageError>;

    /// Stored listing for a date, in listed order.
    async fn security_list(&mut self, date: NaiveDate) -> Result<Vec<SecurityNameRecord>, StorageError>;

    /// All rows of `stock_code` at the latest stored date on or before `as_of`,
    /// ordered by participant id.
    async fn snapshot(
        &mut self,
        stock_code: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<DisclosureRecord>, StorageError>;

    /// Rows in `[start, end]` for the `top_n` largest holders (by shareholding)
    /// at the latest date on or before `end`; ordered by date, then fraction desc.
    async fn top_participant_series(
        &mut self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
        top_n: usize,
    ) -> Result<Vec<TrendRow>, StorageError>;

    /// Distinct (code, name) pairs of securities with at least one disclosure row.
    async fn listed_securities(&mut self) -> Result<Vec<ListedSecurity>, StorageError>;

    async fn date_range(&mut self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), StorageError>;
    async fn disclosure_count(&mut self) -> Result<i64, StorageError>;
    async fn security_count(&mut self) -> Result<i64, StorageError>;
}

// ── Gateway ───────────────────────────────────────────────────────────────────

pub struct StorageGateway {
    backend: Mutex<Box<dyn StorageBackend>>,
    name: &'static str,
}

impl StorageGateway {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        let name = backend.name();
        Self {
            backend: Mutex::new(backend),
            name,
        }
    }

    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        let backend: Box<dyn StorageBackend> = match config.backend {
            BackendKind::DuckDb => Box::new(DuckDbBackend::open(&config.db_path)?),
            BackendKind::QuestDb => Box::new(QuestDbBackend::connect(&config.questdb_url).await?),
        };
        info!("Storage backend: {}", backend.name());
        Ok(Self::new(backend))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self::new(Box::new(DuckDbBackend::open_in_memory()?)))
    }

    pub fn backend_name(&self) -> &'static str {
        self.name
    }

    /// Create tables and indexes. Any failure here is fatal.
    pub async fn initialise(&self) -> Result<(), StorageError> {
        let mut backend = self.backend.lock().await;
        info!("Ensuring schema on {}…", backend.name());
        backend
            .ensure_schema()
            .await
            .map_err(|e| StorageError::Schema(e.to_string()))?;
        backend
            .ensure_indexes()
            .await
            .map_err(|e| StorageError::Schema(e.to_string()))?;
        Ok(())
    }

    pub async fn append_rows(&self, batch: RowBatch<'_>) -> Result<usize, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.backend.lock().await.append_rows(batch).await
    }

    pub async fn scraped_stock_codes(&self, date: NaiveDate) -> Result<HashSet<String>, StorageError> {
        self.backend.lock().await.scraped_stock_codes(date).await
    }

    pub async fn security_list(&self, date: NaiveDate) -> Result<Vec<SecurityNameRecord>, StorageError> {
        self.backend.lock().await.security_list(date).await
    }

    pub async fn snapshot(
        &self,
        stock_code: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<DisclosureRecord>, StorageError> {
        self.backend.lock().await.snapshot(stock_code, as_of).await
    }

    pub async fn top_participant_series(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
        top_n: usize,
    ) -> Result<Vec<TrendRow>, StorageError> {
        self.backend
            .lock()
            .await
            .top_participant_series(stock_code, start, end, top_n)
            .await
    }

    pub async fn listed_securities(&self) -> Result<Vec<ListedSecurity>, StorageError> {
        self.backend.lock().await.listed_securities().await
    }

    pub async fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), StorageError> {
        self.backend.lock().await.date_range().await
    }

    pub async fn disclosure_count(&self) -> Result<i64, StorageError> {
        self.backend.lock().await.disclosure_count().await
    }

    pub async fn security_count(&self) -> Result<i64, StorageError> {
        self.backend.lock().await.security_count().await
    }
}
