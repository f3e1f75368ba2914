//! Read-only queries served to the presentation layer.

use crate::analytics::{counterparty_match, rank_changes, AnalyticsEngine, RankedChanges};
use crate::config::AnalyticsConfig;
use crate::error::StorageError;
use crate::models::{DeltaRow, ListedSecurity, TrendRow};
use crate::scraper::cleaner::display_name;
use crate::storage::StorageGateway;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    pub security_list: Vec<ListedSecurity>,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

pub struct ReadApi {
    storage: Arc<StorageGateway>,
    engine: AnalyticsEngine,
    change_threshold: f64,
}

impl ReadApi {
    pub fn new(storage: Arc<StorageGateway>, config: &AnalyticsConfig) -> Self {
        Self {
            engine: AnalyticsEngine::new(Arc::clone(&storage), config.top_participants),
            storage,
            change_threshold: config.change_threshold,
        }
    }

    /// Securities with at least one disclosure row, plus the stored date span.
    pub async fn get_init_params(&self) -> Result<InitParams, StorageError> {
        let listed = self.storage.listed_securities().await?;
        // stripping quotes can collapse two stored names into one
        let security_list: BTreeSet<ListedSecurity> = listed
            .into_iter()
            .map(|s| ListedSecurity {
                stock_name: display_name(&s.stock_name),
                stock_code: s.stock_code,
            })
            .collect();
        let (min_date, max_date) = self.storage.date_range().await?;
        Ok(InitParams {
            security_list: security_list.into_iter().collect(),
            min_date,
            max_date,
        })
    }

    pub async fn get_trend(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TrendRow>, StorageError> {
        self.engine.top_participant_series(stock_code, start, end).await
    }

    pub async fn get_delta(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DeltaRow>, StorageError> {
        self.engine.shareholding_delta(stock_code, start, end).await
    }

    /// Gainers and losers past the configured change threshold.
    pub async fn get_changes(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RankedChanges, StorageError> {
        let delta = self.get_delta(stock_code, start, end).await?;
        Ok(rank_changes(&delta, self.change_threshold))
    }

    /// Counterparties of `participant_id` within `delta`; empty when the
    /// participant is absent.
    pub fn get_counterparties(&self, delta: &[DeltaRow], participant_id: &str, threshold: Option<f64>) -> Vec<DeltaRow> {
        let threshold = threshold.unwrap_or(self.change_threshold);
        delta
            .iter()
            .find(|r| r.participant_id == participant_id)
            .map(|selected| counterparty_match(delta, selected, threshold))
            .unwrap_or_default()
    }
}
