//! Already-scraped index backing resumable ingestion.
//!
//! Both lookups read persisted rows once per date and cache the answer for
//! the rest of the run. The cache is never refreshed: work finished by another
//! unit mid-run can at worst be re-attempted, never wrongly skipped.

use crate::error::StorageError;
use crate::models::SecurityNameRecord;
use crate::storage::StorageGateway;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct ScrapeLedger {
    storage: Arc<StorageGateway>,
    done_codes: HashMap<NaiveDate, HashSet<String>>,
    lists: HashMap<NaiveDate, Vec<SecurityNameRecord>>,
}

impl ScrapeLedger {
    pub fn new(storage: Arc<StorageGateway>) -> Self {
        Self {
            storage,
            done_codes: HashMap::new(),
            lists: HashMap::new(),
        }
    }

    pub async fn is_security_done(
        &mut self,
        date: NaiveDate,
        stock_code: &str,
    ) -> Result<bool, StorageError> {
        if !self.done_codes.contains_key(&date) {
            let codes = self.storage.scraped_stock_codes(date).await?;
            debug!("{}: {} securities already stored", date, codes.len());
            self.done_codes.insert(date, codes);
        }
        Ok(self
            .done_codes
            .get(&date)
            .is_some_and(|codes| codes.contains(stock_code)))
    }

    pub async fn is_list_done(&mut self, date: NaiveDate) -> Result<bool, StorageError> {
        if !self.lists.contains_key(&date) {
            let list = self.storage.security_list(date).await?;
            debug!("{}: stored list has {} securities", date, list.len());
            self.lists.insert(date, list);
        }
        Ok(self.lists.get(&date).is_some_and(|l| !l.is_empty()))
    }

    /// The stored list for `date`, loaded by `is_list_done`.
    pub fn stored_list(&self, date: NaiveDate) -> &[SecurityNameRecord] {
        self.lists.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remember a list this unit has just persisted.
    pub fn record_list(&mut self, date: NaiveDate, list: Vec<SecurityNameRecord>) {
        self.lists.insert(date, list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DisclosureRecord;
    use crate::storage::RowBatch;

    fn d() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 6, 24).unwrap()
    }

    async fn storage() -> Arc<StorageGateway> {
        let s = StorageGateway::open_in_memory().unwrap();
        s.initialise().await.unwrap();
        Arc::new(s)
    }

    #[tokio::test]
    async fn test_snapshot_is_not_refreshed_mid_run() {
        let storage = storage().await;
        let mut ledger = ScrapeLedger::new(Arc::clone(&storage));
        assert!(!ledger.is_security_done(d(), "00001").await.unwrap());

        let row = DisclosureRecord {
            data_date: d(),
            stock_code: "00001".into(),
            participant_id: "C00019".into(),
            participant_name: "HSBC".into(),
            participant_address: None,
            shareholding: 10,
            frac_of_shares: 5.0,
        };
        storage.append_rows(RowBatch::Disclosures(&[row])).await.unwrap();

        assert!(!ledger.is_security_done(d(), "00001").await.unwrap());
        let mut fresh = ScrapeLedger::new(storage);
        assert!(fresh.is_security_done(d(), "00001").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_done_reads_stored_list() {
        let storage = storage().await;
        let list = vec![SecurityNameRecord {
            data_date: d(),
            stock_code: "00001".into(),
            stock_name: "CKH".into(),
        }];
        storage.append_rows(RowBatch::SecurityNames(&list)).await.unwrap();

        let mut ledger = ScrapeLedger::new(storage);
        assert!(ledger.is_list_done(d()).await.unwrap());
        assert_eq!(ledger.stored_list(d()), list.as_slice());
        assert!(!ledger.is_list_done(d().succ_opt().unwrap()).await.unwrap());
    }
}
