//! Networked time-series backend over the Postgres wire protocol.
//!
//! QuestDB has no window functions and no correlated date subqueries, so the
//! latest-date lookups run as separate `max()` queries and top-K is a plain
//! `ORDER BY … LIMIT`.
//!
//! QuestDB's `DATE` travels over the wire as `timestamp`, so `data_date` is
//! stored as a midnight `TIMESTAMP` and converted at the boundary.

use super::{RowBatch, StorageBackend};
use crate::error::StorageError;
use crate::models::{DisclosureRecord, ListedSecurity, SecurityNameRecord, TrendRow};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashSet;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

const DDL: [&str; 2] = [
    r#"CREATE TABLE IF NOT EXISTS ccass_holdings (
        data_date TIMESTAMP,
        stock_code SYMBOL,
        participant_id SYMBOL,
        participant_name STRING,
        participant_address STRING,
        shareholding LONG,
        frac_of_shares DOUBLE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stock_map (
        data_date TIMESTAMP,
        stock_code SYMBOL,
        stock_name STRING
    )"#,
];

/// Only SYMBOL columns take an index; (code, date) lookups use the code index.
const INDEXED_COLUMNS: [(&str, &str); 3] = [
    ("ccass_holdings", "stock_code"),
    ("ccass_holdings", "participant_id"),
    ("stock_map", "stock_code"),
];

const INSERT_HOLDING: &str = "
    INSERT INTO ccass_holdings
        (data_date, stock_code, participant_id, participant_name, participant_address, shareholding, frac_of_shares)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
";

const INSERT_STOCK_MAP: &str =
    "INSERT INTO stock_map (data_date, stock_code, stock_name) VALUES ($1, $2, $3)";

const LATEST_DATE: &str = "
    SELECT max(data_date) FROM ccass_holdings
    WHERE stock_code = $1 AND data_date <= $2
";

const SNAPSHOT_AT: &str = "
    SELECT data_date, stock_code, participant_id, participant_name,
           participant_address, shareholding, frac_of_shares
    FROM ccass_holdings
    WHERE stock_code = $1 AND data_date = $2
    ORDER BY participant_id
";

fn to_ts(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn from_ts(ts: NaiveDateTime) -> NaiveDate {
    ts.date()
}

/// Participant ids at one date, largest holders first, capped at `top_n`.
fn top_holders_sql(top_n: usize) -> String {
    format!(
        "SELECT participant_id FROM ccass_holdings \
         WHERE stock_code = $1 AND data_date = $2 \
         ORDER BY shareholding DESC, participant_id ASC \
         LIMIT {}",
        top_n
    )
}

/// Rows in `[$2, $3]` for the `n` participant ids bound from `$4` on.
fn series_sql(n: usize) -> String {
    format!(
        "SELECT data_date, participant_id, participant_name, frac_of_shares \
         FROM ccass_holdings \
         WHERE stock_code = $1 AND data_date >= $2 AND data_date <= $3 \
         AND participant_id IN ({}) \
         ORDER BY data_date ASC, frac_of_shares DESC, participant_id ASC",
        placeholders(4, n)
    )
}

/// Drop repeated ids, keeping first-seen order.
fn distinct_in_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

pub struct QuestDbBackend {
    client: Client,
}

impl QuestDbBackend {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let (client, connection) =
            tokio_postgres::connect(url, NoTls)
                .await
                .map_err(|e| StorageError::Connect {
                    backend: "questdb",
                    reason: e.to_string(),
                })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("QuestDB connection closed: {}", e);
            }
        });

        info!("Connected to QuestDB");
        Ok(Self { client })
    }

    async fn latest_date(
        &self,
        stock_code: &str,
        as_of: NaiveDate,
    ) -> Result<Option<NaiveDate>, StorageError> {
        let row = self
            .client
            .query_one(LATEST_DATE, &[&stock_code, &to_ts(as_of)])
            .await?;
        let latest: Option<NaiveDateTime> = row.try_get(0)?;
        Ok(latest.map(from_ts))
    }

    async fn append_holdings(&mut self, rows: &[DisclosureRecord]) -> Result<(), tokio_postgres::Error> {
        let tx = self.client.transaction().await?;
        let stmt = tx.prepare(INSERT_HOLDING).await?;
        for r in rows {
            tx.execute(
                &stmt,
                &[
                    &to_ts(r.data_date),
                    &r.stock_code,
                    &r.participant_id,
                    &r.participant_name,
                    &r.participant_address,
                    &r.shareholding,
                    &r.frac_of_shares,
                ],
            )
            .await?;
        }
        tx.commit().await
    }

    async fn append_stock_map(&mut self, rows: &[SecurityNameRecord]) -> Result<(), tokio_postgres::Error> {
        let tx = self.client.transaction().await?;
        let stmt = tx.prepare(INSERT_STOCK_MAP).await?;
        for r in rows {
            tx.execute(&stmt, &[&to_ts(r.data_date), &r.stock_code, &r.stock_name])
                .await?;
        }
        tx.commit().await
    }
}

fn disclosure_from_row(row: &Row) -> Result<DisclosureRecord, tokio_postgres::Error> {
    Ok(DisclosureRecord {
        data_date: from_ts(row.try_get(0)?),
        stock_code: row.try_get(1)?,
        participant_id: row.try_get(2)?,
        participant_name: row.try_get(3)?,
        participant_address: row.try_get(4)?,
        shareholding: row.try_get(5)?,
        frac_of_shares: row.try_get(6)?,
    })
}

/// `$offset, $offset+1, …` for an `IN (…)` list of `n` values.
fn placeholders(offset: usize, n: usize) -> String {
    (offset..offset + n)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl StorageBackend for QuestDbBackend {
    fn name(&self) -> &'static str {
        "questdb"
    }

    async fn ensure_schema(&mut self) -> Result<(), StorageError> {
        for ddl in DDL {
            self.client.batch_execute(ddl).await?;
        }
        Ok(())
    }

    async fn ensure_indexes(&mut self) -> Result<(), StorageError> {
        for (table, column) in INDEXED_COLUMNS {
            let sql = format!("ALTER TABLE {} ALTER COLUMN {} ADD INDEX", table, column);
            if let Err(e) = self.client.batch_execute(&sql).await {
                // re-adding an index is rejected rather than ignored
                if !e.to_string().contains("already indexed") {
                    return Err(e.into());
                }
                debug!("{}.{} already indexed", table, column);
            }
        }
        Ok(())
    }

    async fn append_rows(&mut self, batch: RowBatch<'_>) -> Result<usize, StorageError> {
        let result = match batch {
            RowBatch::Disclosures(rows) => self.append_holdings(rows).await,
            RowBatch::SecurityNames(rows) => self.append_stock_map(rows).await,
        };
        result.map_err(|e| StorageError::Write {
            table: batch.table(),
            reason: e.to_string(),
        })?;
        debug!("{} rows appended to {}", batch.len(), batch.table());
        Ok(batch.len())
    }

    async fn scraped_stock_codes(&mut self, date: NaiveDate) -> Result<HashSet<String>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT stock_code FROM ccass_holdings WHERE data_date = $1",
                &[&to_ts(date)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<_, String>(0))
            .collect::<Result<_, _>>()?)
    }

    async fn security_list(&mut self, date: NaiveDate) -> Result<Vec<SecurityNameRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT data_date, stock_code, stock_name FROM stock_map WHERE data_date = $1",
                &[&to_ts(date)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                Ok(SecurityNameRecord {
                    data_date: from_ts(r.try_get(0)?),
                    stock_code: r.try_get(1)?,
                    stock_name: r.try_get(2)?,
                })
            })
            .collect::<Result<_, tokio_postgres::Error>>()?)
    }

    async fn snapshot(
        &mut self,
        stock_code: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<DisclosureRecord>, StorageError> {
        let Some(date) = self.latest_date(stock_code, as_of).await? else {
            return Ok(vec![]);
        };
        let rows = self
            .client
            .query(SNAPSHOT_AT, &[&stock_code, &to_ts(date)])
            .await?;
        Ok(rows
            .iter()
            .map(disclosure_from_row)
            .collect::<Result<_, _>>()?)
    }

    async fn top_participant_series(
        &mut self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
        top_n: usize,
    ) -> Result<Vec<TrendRow>, StorageError> {
        let Some(latest) = self.latest_date(stock_code, end).await? else {
            return Ok(vec![]);
        };

        let top: Vec<String> = self
            .client
            .query(&top_holders_sql(top_n), &[&stock_code, &to_ts(latest)])
            .await?
            .iter()
            .map(|r| r.try_get(0))
            .collect::<Result<_, _>>()?;
        let top = distinct_in_order(top);
        if top.is_empty() {
            return Ok(vec![]);
        }

        let (start, end) = (to_ts(start), to_ts(end));
        let mut args: Vec<&(dyn ToSql + Sync)> = vec![&stock_code, &start, &end];
        args.extend(top.iter().map(|id| id as &(dyn ToSql + Sync)));

        let rows = self.client.query(&series_sql(top.len()), &args).await?;
        Ok(rows
            .iter()
            .map(|r| {
                Ok(TrendRow {
                    data_date: from_ts(r.try_get(0)?),
                    participant_id: r.try_get(1)?,
                    participant_name: r.try_get(2)?,
                    frac_of_shares: r.try_get(3)?,
                })
            })
            .collect::<Result<_, tokio_postgres::Error>>()?)
    }

    async fn listed_securities(&mut self) -> Result<Vec<ListedSecurity>, StorageError> {
        let with_data = self.client.query("SELECT DISTINCT stock_code FROM ccass_holdings", &[]).await?;
        let with_data: HashSet<String> = with_data
            .iter()
            .map(|r| r.try_get(0))
            .collect::<Result<_, _>>()?;

        let rows = self
            .client
            .query(
                "SELECT DISTINCT stock_code, stock_name FROM stock_map ORDER BY stock_code, stock_name",
                &[],
            )
            .await?;
        let mut listed = Vec::with_capacity(rows.len());
        for r in &rows {
            let sec = ListedSecurity {
                stock_code: r.try_get(0)?,
                stock_name: r.try_get(1)?,
            };
            if with_data.contains(&sec.stock_code) {
                listed.push(sec);
            }
        }
        Ok(listed)
    }

    async fn date_range(&mut self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), StorageError> {
        let row = self
            .client
            .query_one("SELECT min(data_date), max(data_date) FROM ccass_holdings", &[])
            .await?;
        let min: Option<NaiveDateTime> = row.try_get(0)?;
        let max: Option<NaiveDateTime> = row.try_get(1)?;
        Ok((min.map(from_ts), max.map(from_ts)))
    }

    async fn disclosure_count(&mut self) -> Result<i64, StorageError> {
        let row = self.client.query_one("SELECT count() FROM ccass_holdings", &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn security_count(&mut self) -> Result<i64, StorageError> {
        let row = self
            .client
            .query_one("SELECT count_distinct(stock_code) FROM ccass_holdings", &[])
            .await?;
        Ok(row.try_get(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DuckDbBackend;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(4, 3), "$4, $5, $6");
        assert_eq!(placeholders(1, 1), "$1");
        assert_eq!(placeholders(2, 0), "");
    }

    #[test]
    fn test_dates_round_trip_through_midnight_timestamp() {
        let date = NaiveDate::from_ymd_opt(2022, 6, 24).unwrap();
        let ts = to_ts(date);
        assert_eq!(ts.to_string(), "2022-06-24 00:00:00");
        assert_eq!(from_ts(ts), date);
    }

    #[test]
    fn test_top_holders_sql_limits_after_ordering() {
        let sql = top_holders_sql(10);
        assert!(sql.contains("ORDER BY shareholding DESC, participant_id ASC"));
        assert!(sql.ends_with("LIMIT 10"));
        assert!(sql.contains("stock_code = $1 AND data_date = $2"));
    }

    #[test]
    fn test_series_sql_binds_ids_after_window() {
        let sql = series_sql(3);
        assert!(sql.contains("data_date >= $2 AND data_date <= $3"));
        assert!(sql.contains("participant_id IN ($4, $5, $6)"));
        assert!(sql.ends_with("ORDER BY data_date ASC, frac_of_shares DESC, participant_id ASC"));
    }

    #[test]
    fn test_top_ids_deduplicated_in_rank_order() {
        let ids = ["C1", "None", "C2", "None", "C1"].map(String::from).to_vec();
        assert_eq!(distinct_in_order(ids), vec!["C1", "None", "C2"]);
    }

    fn rec(date: NaiveDate, code: &str, id: &str, shares: i64, frac: f64) -> DisclosureRecord {
        DisclosureRecord {
            data_date: date,
            stock_code: code.to_string(),
            participant_id: id.to_string(),
            participant_name: format!("P-{}", id),
            participant_address: Some("HK".to_string()),
            shareholding: shares,
            frac_of_shares: frac,
        }
    }

    /// Needs a local QuestDB: `CCASS_TEST_QUESTDB_URL` or the default pg-wire port.
    #[tokio::test]
    #[ignore]
    async fn test_matches_duckdb_results() {
        let url = std::env::var("CCASS_TEST_QUESTDB_URL").unwrap_or_else(|_| {
            "host=localhost port=8812 user=admin password=quest dbname=qdb".to_string()
        });
        let mut quest = QuestDbBackend::connect(&url).await.unwrap();
        quest.ensure_schema().await.unwrap();
        quest.ensure_indexes().await.unwrap();
        let mut duck = DuckDbBackend::open_in_memory().unwrap();
        duck.ensure_schema().await.unwrap();

        // tables persist between runs, so use a code no earlier run wrote
        let code = format!("T{}", chrono::Utc::now().timestamp_millis());
        let d1 = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2022, 6, 3).unwrap();
        let mut rows = Vec::new();
        for i in 0..12i64 {
            let id = format!("P{:02}", i);
            rows.push(rec(d1, &code, &id, 100 + i, 1.0 + i as f64));
            rows.push(rec(d2, &code, &id, 300 - i, 2.0 + i as f64));
        }
        rows.push(rec(d2, &code, "None", 5, 0.5));

        for backend in [&mut quest as &mut dyn StorageBackend, &mut duck] {
            assert_eq!(backend.append_rows(RowBatch::Disclosures(&rows)).await.unwrap(), rows.len());
        }

        let as_of = NaiveDate::from_ymd_opt(2022, 6, 2).unwrap();
        assert_eq!(
            quest.snapshot(&code, as_of).await.unwrap(),
            duck.snapshot(&code, as_of).await.unwrap()
        );
        let quest_series = quest.top_participant_series(&code, d1, d2, 10).await.unwrap();
        assert_eq!(quest_series, duck.top_participant_series(&code, d1, d2, 10).await.unwrap());
        assert_eq!(quest_series.len(), 20);
        assert!(quest.scraped_stock_codes(d2).await.unwrap().contains(&code));
    }
}
