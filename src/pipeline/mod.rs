//! Ingestion coordinator: ties page fetching → parsing → ledger → storage together.
//!
//! ## Per-day state machine
//!
//!   `ListPending` → `ListReady` → `PerSecurity` → `DayComplete`
//!
//!   1. Reuse the stored security list for the day, or fetch + parse + store it.
//!   2. Set the search form's date once for the whole day.
//!   3. Walk the list in order, skipping securities the ledger already holds,
//!      buffering parsed rows and flushing every `buffer_size` securities-with-data.
//!   4. Flush the remainder at day end.
//!
//! Re-running a day resumes at the first security without stored rows. A
//! failed fetch leaves its security not-done so the next run retries it.
//!
//! ## Concurrency
//!
//! `run()` hands whole days to at most `workers` units. Each unit opens its own
//! session, and every storage call goes through the gateway's single lock.

use crate::config::{AppConfig, IngestionConfig};
use crate::error::StorageError;
use crate::ledger::ScrapeLedger;
use crate::models::{DisclosureRecord, SecurityNameRecord};
use crate::scraper::parsers::{parse_disclosure_table, parse_security_list};
use crate::scraper::{PageFetcher, SessionFactory};
use crate::storage::{RowBatch, StorageGateway};
use crate::utils::Timer;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    ListPending,
    ListReady,
    PerSecurity,
    DayComplete,
    /// Loop finished but some security or flush failed; a later run retries.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayReport {
    pub date: NaiveDate,
    pub state: DayState,
    pub listed: usize,
    pub skipped: usize,
    pub with_data: usize,
    pub empty: usize,
    pub failed: usize,
    pub rows_stored: usize,
    pub flush_failures: usize,
}

impl DayReport {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            state: DayState::ListPending,
            listed: 0,
            skipped: 0,
            with_data: 0,
            empty: 0,
            failed: 0,
            rows_stored: 0,
            flush_failures: 0,
        }
    }

    fn advance(&mut self, next: DayState) {
        debug!("{}: {:?} → {:?}", self.date, self.state, next);
        self.state = next;
    }
}

/// Rows buffered between flushes.
#[derive(Default)]
struct RowBuffer {
    rows: Vec<DisclosureRecord>,
    securities: usize,
}

impl RowBuffer {
    fn push(&mut self, rows: Vec<DisclosureRecord>) {
        self.rows.extend(rows);
        self.securities += 1;
    }

    fn take(&mut self) -> Vec<DisclosureRecord> {
        self.securities = 0;
        std::mem::take(&mut self.rows)
    }
}

pub struct Pipeline {
    storage: Arc<StorageGateway>,
    sessions: SessionFactory,
    ingestion: IngestionConfig,
    max_securities: usize,
}

impl Pipeline {
    pub fn new(config: &AppConfig, storage: Arc<StorageGateway>, sessions: SessionFactory) -> Self {
        Self {
            storage,
            sessions,
            ingestion: config.ingestion.clone(),
            max_securities: config.scraper.max_securities,
        }
    }

    /// Ingest many days with at most `workers` days in flight.
    pub async fn run(self: &Arc<Self>, dates: &[NaiveDate]) -> Result<PipelineStats> {
        // one unit per day, so no security is ever claimed twice
        let mut seen = BTreeSet::new();
        let dates: Vec<NaiveDate> = dates.iter().copied().filter(|d| seen.insert(*d)).collect();

        info!("=== Ingesting {} days with {} workers ===", dates.len(), self.ingestion.workers.max(1));
        let sem = Arc::new(Semaphore::new(self.ingestion.workers.max(1)));
        let mut handles = Vec::new();

        for (unit, date) in dates.into_iter().enumerate() {
            let pipeline = Arc::clone(self);
            let sem = Arc::clone(&sem);

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire().await?;
                pipeline.run_unit(unit, date).await
            });
            handles.push((date, handle));
        }

        let mut stats = PipelineStats::default();
        for (date, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => stats.record(&report),
                Ok(Err(e)) => {
                    if e.downcast_ref::<StorageError>().is_some_and(StorageError::is_fatal) {
                        return Err(e.context(format!("fatal storage error on {}", date)));
                    }
                    warn!("{}: {:#}", date, e);
                    stats.days_failed += 1;
                }
                Err(e) => {
                    error!("Task panic for {}: {}", date, e);
                    stats.days_failed += 1;
                }
            }
        }

        info!(
            "=== Done: {} days ({} complete, {} failed) | {} rows | {} securities failed ===",
            stats.days_attempted, stats.days_complete, stats.days_failed,
            stats.rows_stored, stats.securities_failed,
        );
        Ok(stats)
    }

    /// Ingest a single day in a fresh session. Safe to re-invoke.
    pub async fn run_daily_ingestion(&self, date: NaiveDate) -> Result<DayReport> {
        self.run_unit(0, date).await
    }

    /// One day in its own session. `unit` numbers the day within the run.
    ///
    /// `close` runs on both outcomes of `run_day`; if the day panics the
    /// session is dropped during unwinding instead.
    async fn run_unit(&self, unit: usize, date: NaiveDate) -> Result<DayReport> {
        let _t = Timer::start(format!("unit {} day {}", unit, date));
        let mut session = (self.sessions)(unit).context("Failed to open session")?;
        let mut ledger = ScrapeLedger::new(Arc::clone(&self.storage));

        let result = self.run_day(session.as_mut(), &mut ledger, date).await;
        session.close().await;
        result
    }

    /// Drive one day through the state machine with the given session and ledger.
    pub async fn run_day(
        &self,
        fetcher: &mut dyn PageFetcher,
        ledger: &mut ScrapeLedger,
        date: NaiveDate,
    ) -> Result<DayReport> {
        let mut report = DayReport::new(date);

        // ── ListPending → ListReady ───────────────────────────────────────────
        let list = self.security_list(fetcher, ledger, date).await?;
        report.listed = list.len();
        report.advance(DayState::ListReady);

        if list.is_empty() {
            info!("{}: empty security list, nothing to do", date);
            report.advance(DayState::DayComplete);
            return Ok(report);
        }

        // ── ListReady → PerSecurity ───────────────────────────────────────────
        fetcher
            .prepare_search(date)
            .await
            .with_context(|| format!("search form for {}", date))?;
        report.advance(DayState::PerSecurity);

        let mut buffer = RowBuffer::default();
        let buffer_size = self.ingestion.buffer_size.max(1);

        for (i, security) in list.iter().enumerate() {
            let code = security.stock_code.as_str();

            if ledger.is_security_done(date, code).await? {
                report.skipped += 1;
                continue;
            }

            match self.scrape_security(fetcher, date, code).await {
                Ok(rows) if rows.is_empty() => report.empty += 1,
                Ok(rows) => {
                    report.with_data += 1;
                    buffer.push(rows);
                }
                Err(e) => {
                    warn!("{} {}: no data ({:#})", date, code, e);
                    report.failed += 1;
                }
            }

            if i % 100 == 0 {
                info!(
                    "{}: {} ({} with data, {} of {})",
                    date, code, report.with_data, i + 1, report.listed
                );
            }

            if buffer.securities >= buffer_size {
                self.flush(&mut buffer, &mut report).await?;
            }
        }

        if !buffer.rows.is_empty() {
            self.flush(&mut buffer, &mut report).await?;
        }

        // ── PerSecurity → DayComplete ─────────────────────────────────────────
        if report.failed == 0 && report.flush_failures == 0 {
            report.advance(DayState::DayComplete);
        } else {
            report.advance(DayState::Incomplete);
        }

        info!(
            "Finished {}: {:?} | {} listed, {} skipped, {} with data, {} empty, {} failed, {} rows",
            date, report.state, report.listed, report.skipped, report.with_data,
            report.empty, report.failed, report.rows_stored,
        );
        Ok(report)
    }

    async fn security_list(
        &self,
        fetcher: &mut dyn PageFetcher,
        ledger: &mut ScrapeLedger,
        date: NaiveDate,
    ) -> Result<Vec<SecurityNameRecord>> {
        if ledger.is_list_done(date).await? {
            let list = ledger.stored_list(date).to_vec();
            debug!("{}: reusing stored list ({} securities)", date, list.len());
            return Ok(list);
        }

        let html = fetcher
            .fetch_security_list(date)
            .await
            .with_context(|| format!("security list for {}", date))?;
        let list = parse_security_list(&html, date, self.max_securities)?;

        info!("{}: loading {} securities into stock map", date, list.len());
        match self.storage.append_rows(RowBatch::SecurityNames(&list)).await {
            Ok(_) => ledger.record_list(date, list.clone()),
            Err(e) if self.ingestion.strict_flush => {
                return Err(e).context(format!("storing security list for {}", date));
            }
            Err(e) => error!("{}: could not store security list: {}", date, e),
        }
        Ok(list)
    }

    async fn scrape_security(
        &self,
        fetcher: &mut dyn PageFetcher,
        date: NaiveDate,
        code: &str,
    ) -> Result<Vec<DisclosureRecord>> {
        let html = fetcher.search_security(code).await?;
        let rows = parse_disclosure_table(&html, date, code, self.ingestion.shareholding_threshold)?;
        debug!("{} {}: {} rows", date, code, rows.len());
        Ok(rows)
    }

    async fn flush(&self, buffer: &mut RowBuffer, report: &mut DayReport) -> Result<()> {
        let rows = buffer.take();
        info!("{}: loading {} rows into db", report.date, rows.len());

        match self.storage.append_rows(RowBatch::Disclosures(&rows)).await {
            Ok(n) => report.rows_stored += n,
            Err(e) => {
                report.flush_failures += 1;
                if self.ingestion.strict_flush {
                    bail!("{}: flush of {} rows failed: {}", report.date, rows.len(), e);
                }
                // the ledger never saw these securities, so a later run retries them
                error!("{}: write error, {} rows dropped: {}", report.date, rows.len(), e);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub days_attempted: usize,
    pub days_complete: usize,
    pub days_failed: usize,
    pub rows_stored: usize,
    pub securities_failed: usize,
}

impl PipelineStats {
    fn record(&mut self, report: &DayReport) {
        self.days_attempted += 1;
        if report.state == DayState::DayComplete {
            self.days_complete += 1;
        }
        self.rows_stored += report.rows_stored;
        self.securities_failed += report.failed;
    }
}
