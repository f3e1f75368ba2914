use super::{RowBatch, StorageBackend};
use crate::error::StorageError;
use crate::models::{DisclosureRecord, ListedSecurity, SecurityNameRecord, TrendRow};
use async_trait::async_trait;
use chrono::NaiveDate;
use duckdb::{Connection, params};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS ccass_holdings (
    data_date            DATE     NOT NULL,
    stock_code           VARCHAR  NOT NULL,
    participant_id       VARCHAR  NOT NULL,
    participant_name     VARCHAR  NOT NULL,
    participant_address  VARCHAR,
    shareholding         BIGINT   NOT NULL,
    frac_of_shares       DOUBLE   NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_map (
    data_date   DATE     NOT NULL,
    stock_code  VARCHAR  NOT NULL,
    stock_name  VARCHAR  NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_holdings_code      ON ccass_holdings (stock_code);
CREATE INDEX IF NOT EXISTS idx_holdings_date      ON ccass_holdings (data_date);
CREATE INDEX IF NOT EXISTS idx_holdings_code_date ON ccass_holdings (stock_code, data_date);
CREATE INDEX IF NOT EXISTS idx_stock_map_date      ON stock_map (data_date);
CREATE INDEX IF NOT EXISTS idx_stock_map_code      ON stock_map (stock_code);
CREATE INDEX IF NOT EXISTS idx_stock_map_date_code ON stock_map (data_date, stock_code);
"#;

const INSERT_HOLDING: &str = r#"
    INSERT INTO ccass_holdings
        (data_date, stock_code, participant_id, participant_name, participant_address, shareholding, frac_of_shares)
    VALUES (?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_STOCK_MAP: &str =
    "INSERT INTO stock_map (data_date, stock_code, stock_name) VALUES (?, ?, ?)";

const SNAPSHOT: &str = r#"
    SELECT data_date, stock_code, participant_id, participant_name,
           participant_address, shareholding, frac_of_shares
    FROM ccass_holdings
    WHERE stock_code = ?
      AND data_date = (
          SELECT MAX(data_date) FROM ccass_holdings
          WHERE stock_code = ? AND data_date <= ?
      )
    ORDER BY participant_id
"#;

const TOP_PARTICIPANT_SERIES: &str = r#"
    WITH latest AS (
        SELECT MAX(data_date) AS d FROM ccass_holdings
        WHERE stock_code = ? AND data_date <= ?
    ),
    ranked AS (
        SELECT participant_id,
               ROW_NUMBER() OVER (ORDER BY shareholding DESC, participant_id ASC) AS rk
        FROM ccass_holdings
        WHERE stock_code = ? AND data_date = (SELECT d FROM latest)
    )
    SELECT data_date, participant_id, participant_name, frac_of_shares
    FROM ccass_holdings
    WHERE stock_code = ?
      AND data_date BETWEEN ? AND ?
      AND participant_id IN (SELECT participant_id FROM ranked WHERE rk <= ?)
    ORDER BY data_date ASC, frac_of_shares DESC, participant_id ASC
"#;

const LISTED_SECURITIES: &str = r#"
    SELECT DISTINCT stock_code, stock_name FROM stock_map
    WHERE stock_code IN (SELECT DISTINCT stock_code FROM ccass_holdings)
    ORDER BY stock_code, stock_name
"#;

// ── Backend ───────────────────────────────────────────────────────────────────

/// Embedded single-file store.
pub struct DuckDbBackend {
    conn: Connection,
}

impl DuckDbBackend {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connect {
                backend: "duckdb",
                reason: format!("could not create dir {:?}: {}", parent, e),
            })?;
        }
        let conn = Connection::open(path).map_err(|e| StorageError::Connect {
            backend: "duckdb",
            reason: format!("{:?}: {}", path, e),
        })?;
        info!("Opened DuckDB at {:?}", path);
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    fn append_holdings(&self, rows: &[DisclosureRecord]) -> duckdb::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_HOLDING)?;
            for r in rows {
                stmt.execute(params![
                    r.data_date,
                    r.stock_code,
                    r.participant_id,
                    r.participant_name,
                    r.participant_address,
                    r.shareholding,
                    r.frac_of_shares,
                ])?;
            }
        }
        tx.commit()
    }

    fn append_stock_map(&self, rows: &[SecurityNameRecord]) -> duckdb::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_STOCK_MAP)?;
            for r in rows {
                stmt.execute(params![r.data_date, r.stock_code, r.stock_name])?;
            }
        }
        tx.commit()
    }
}

#[async_trait]
impl StorageBackend for DuckDbBackend {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    async fn ensure_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(DDL)?;
        Ok(())
    }

    async fn ensure_indexes(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(INDEXES)?;
        Ok(())
    }

    async fn append_rows(&mut self, batch: RowBatch<'_>) -> Result<usize, StorageError> {
        let result = match batch {
            RowBatch::Disclosures(rows) => self.append_holdings(rows),
            RowBatch::SecurityNames(rows) => self.append_stock_map(rows),
        };
        result.map_err(|e| StorageError::Write {
            table: batch.table(),
            reason: e.to_string(),
        })?;
        debug!("{} rows appended to {}", batch.len(), batch.table());
        Ok(batch.len())
    }

    async fn scraped_stock_codes(&mut self, date: NaiveDate) -> Result<HashSet<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT stock_code FROM ccass_holdings WHERE data_date = ?")?;
        let codes = stmt
            .query_map(params![date], |r| r.get::<_, String>(0))?
            .collect::<duckdb::Result<HashSet<_>>>()?;
        Ok(codes)
    }

    async fn security_list(&mut self, date: NaiveDate) -> Result<Vec<SecurityNameRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT data_date, stock_code, stock_name FROM stock_map WHERE data_date = ? ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![date], |r| {
                Ok(SecurityNameRecord {
                    data_date: r.get(0)?,
                    stock_code: r.get(1)?,
                    stock_name: r.get(2)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn snapshot(
        &mut self,
        stock_code: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<DisclosureRecord>, StorageError> {
        let mut stmt = self.conn.prepare(SNAPSHOT)?;
        let rows = stmt
            .query_map(params![stock_code, stock_code, as_of], |r| {
                Ok(DisclosureRecord {
                    data_date: r.get(0)?,
                    stock_code: r.get(1)?,
                    participant_id: r.get(2)?,
                    participant_name: r.get(3)?,
                    participant_address: r.get(4)?,
                    shareholding: r.get(5)?,
                    frac_of_shares: r.get(6)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn top_participant_series(
        &mut self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
        top_n: usize,
    ) -> Result<Vec<TrendRow>, StorageError> {
        let mut stmt = self.conn.prepare(TOP_PARTICIPANT_SERIES)?;
        let rows = stmt
            .query_map(
                params![stock_code, end, stock_code, stock_code, start, end, top_n as i64],
                |r| {
                    Ok(TrendRow {
                        data_date: r.get(0)?,
                        participant_id: r.get(1)?,
                        participant_name: r.get(2)?,
                        frac_of_shares: r.get(3)?,
                    })
                },
            )?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn listed_securities(&mut self) -> Result<Vec<ListedSecurity>, StorageError> {
        let mut stmt = self.conn.prepare(LISTED_SECURITIES)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ListedSecurity {
                    stock_code: r.get(0)?,
                    stock_name: r.get(1)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn date_range(&mut self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), StorageError> {
        let mut s = self
            .conn
            .prepare("SELECT MIN(data_date), MAX(data_date) FROM ccass_holdings")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    async fn disclosure_count(&mut self) -> Result<i64, StorageError> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM ccass_holdings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    async fn security_count(&mut self) -> Result<i64, StorageError> {
        let mut s = self
            .conn
            .prepare("SELECT COUNT(DISTINCT stock_code) FROM ccass_holdings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }
}
