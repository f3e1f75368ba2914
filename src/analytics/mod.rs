//! Shareholding trend, snapshot deltas and counterparty matching.

use crate::error::StorageError;
use crate::models::{DeltaRow, DisclosureRecord, TrendRow};
use crate::storage::StorageGateway;
use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Share of the selected move a single counterparty must reach to be kept
/// without aggregation.
pub const BIG_MOVER_RATIO: f64 = 0.5;

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub struct AnalyticsEngine {
    storage: Arc<StorageGateway>,
    top_n: usize,
}

impl AnalyticsEngine {
    pub fn new(storage: Arc<StorageGateway>, top_n: usize) -> Self {
        Self { storage, top_n }
    }

    /// Series of the top holders as of the latest date on or before `end`.
    pub async fn top_participant_series(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TrendRow>, StorageError> {
        self.storage
            .top_participant_series(stock_code, start, end, self.top_n)
            .await
    }

    pub async fn shareholding_delta(
        &self,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DeltaRow>, StorageError> {
        let before = self.storage.snapshot(stock_code, start).await?;
        let after = self.storage.snapshot(stock_code, end).await?;
        debug!(
            "{}: delta over {} → {} rows",
            stock_code,
            before.len(),
            after.len()
        );
        Ok(compute_delta(&before, &after, start, end))
    }
}

// ── Delta ─────────────────────────────────────────────────────────────────────

struct Side {
    name: String,
    frac: f64,
}

/// Sum fractions per participant; the `"None"` sentinel can repeat.
fn by_participant(rows: &[DisclosureRecord]) -> BTreeMap<&str, Side> {
    let mut map: BTreeMap<&str, Side> = BTreeMap::new();
    for r in rows {
        map.entry(r.participant_id.as_str())
            .and_modify(|s| s.frac += r.frac_of_shares)
            .or_insert_with(|| Side {
                name: r.participant_name.clone(),
                frac: r.frac_of_shares,
            });
    }
    map
}

/// Full outer join of two snapshots on participant id.
///
/// A participant missing from one side counts as 0 there. Rows are ordered by
/// change descending, then participant id ascending. Snapshot dates come from
/// the rows; an empty side reports the requested date.
pub fn compute_delta(
    before: &[DisclosureRecord],
    after: &[DisclosureRecord],
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<DeltaRow> {
    let start_date = before.first().map(|r| r.data_date).unwrap_or(start);
    let end_date = after.first().map(|r| r.data_date).unwrap_or(end);
    let start_side = by_participant(before);
    let end_side = by_participant(after);

    let mut ids: Vec<&str> = start_side.keys().chain(end_side.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut rows: Vec<DeltaRow> = ids
        .into_iter()
        .map(|id| {
            let s = start_side.get(id);
            let e = end_side.get(id);
            let start_frac = s.map(|s| s.frac).unwrap_or(0.0);
            let end_frac = e.map(|e| e.frac).unwrap_or(0.0);
            DeltaRow {
                participant_id: id.to_string(),
                participant_name: e.or(s).map(|x| x.name.clone()).unwrap_or_default(),
                start_data_date: start_date,
                start_frac_of_shares: start_frac,
                end_data_date: end_date,
                end_frac_of_shares: end_frac,
                change: round2(end_frac - start_frac),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.change
            .partial_cmp(&a.change)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });
    rows
}

// ── Ranked changes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RankedChanges {
    /// change ≥ threshold, largest first
    pub gainers: Vec<DeltaRow>,
    /// change ≤ −threshold, most negative first
    pub losers: Vec<DeltaRow>,
}

pub fn rank_changes(delta: &[DeltaRow], threshold: f64) -> RankedChanges {
    let mut gainers: Vec<DeltaRow> = delta.iter().filter(|r| r.change >= threshold).cloned().collect();
    let mut losers: Vec<DeltaRow> = delta.iter().filter(|r| r.change <= -threshold).cloned().collect();
    gainers.sort_by(|a, b| by_magnitude(a, b));
    losers.sort_by(|a, b| by_magnitude(a, b));
    RankedChanges { gainers, losers }
}

fn by_magnitude(a: &DeltaRow, b: &DeltaRow) -> Ordering {
    b.change
        .abs()
        .partial_cmp(&a.change.abs())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.participant_id.cmp(&b.participant_id))
}

// ── Counterparty heuristic ────────────────────────────────────────────────────

/// Plausible counterparties of `selected`'s move. Approximate: this pairs
/// opposite movers by size, it does not prove any trade took place.
///
/// Candidates move the other way by at least `threshold`, ranked by size.
/// Any candidate covering half of the selected move is kept outright; the
/// rest are taken in rank order until the kept moves add up to the selected
/// move.
pub fn counterparty_match(delta: &[DeltaRow], selected: &DeltaRow, threshold: f64) -> Vec<DeltaRow> {
    let target = selected.change.abs();
    if target == 0.0 {
        return vec![];
    }
    let buyer = selected.change > 0.0;

    let mut candidates: Vec<&DeltaRow> = delta
        .iter()
        .filter(|r| r.participant_id != selected.participant_id)
        .filter(|r| if buyer { r.change < 0.0 } else { r.change > 0.0 })
        .filter(|r| r.change.abs() >= threshold)
        .collect();
    candidates.sort_by(|a, b| by_magnitude(a, b));

    let cutoff = BIG_MOVER_RATIO * target;
    let mut covered: f64 = candidates
        .iter()
        .filter(|r| r.change.abs() >= cutoff)
        .map(|r| r.change.abs())
        .sum();

    let mut matched = Vec::new();
    for r in candidates {
        let size = r.change.abs();
        if size >= cutoff {
            matched.push(r.clone());
        } else if covered < target {
            covered += size;
            matched.push(r.clone());
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RowBatch;
    use pretty_assertions::assert_eq;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 6, day).unwrap()
    }

    fn rec(day: u32, id: &str, frac: f64) -> DisclosureRecord {
        DisclosureRecord {
            data_date: d(day),
            stock_code: "00001".into(),
            participant_id: id.into(),
            participant_name: format!("NAME {}", id),
            participant_address: None,
            shareholding: (frac * 1000.0) as i64,
            frac_of_shares: frac,
        }
    }

    fn delta(id: &str, change: f64) -> DeltaRow {
        DeltaRow {
            participant_id: id.into(),
            participant_name: id.into(),
            start_data_date: d(1),
            start_frac_of_shares: 0.0,
            end_data_date: d(2),
            end_frac_of_shares: change,
            change,
        }
    }

    fn changes(rows: &[DeltaRow]) -> Vec<f64> {
        rows.iter().map(|r| r.change).collect()
    }

    #[test]
    fn test_delta_full_outer_join() {
        let before = vec![rec(1, "A", 10.0), rec(1, "B", 5.0)];
        let after = vec![rec(2, "B", 7.126), rec(2, "C", 3.0)];
        let rows = compute_delta(&before, &after, d(1), d(2));

        let ids: Vec<&str> = rows.iter().map(|r| r.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["C", "B", "A"]);
        assert_eq!(changes(&rows), vec![3.0, 2.13, -10.0]);
        assert_eq!(rows[2].end_frac_of_shares, 0.0);
        assert_eq!(rows[0].start_frac_of_shares, 0.0);
        assert_eq!(rows[0].participant_name, "NAME C");
    }

    #[test]
    fn test_delta_swapping_snapshots_negates_changes() {
        let before = vec![rec(1, "A", 10.0), rec(1, "B", 5.555), rec(1, "D", 1.0)];
        let after = vec![rec(2, "B", 7.125), rec(2, "C", 3.3), rec(2, "D", 1.0)];

        let forward = compute_delta(&before, &after, d(1), d(2));
        let backward = compute_delta(&after, &before, d(2), d(1));
        assert_eq!(forward.len(), 4);
        for f in &forward {
            let b = backward.iter().find(|b| b.participant_id == f.participant_id).unwrap();
            assert_eq!(b.change, -f.change);
        }
    }

    #[test]
    fn test_delta_ties_broken_by_participant_id() {
        let after = vec![rec(2, "Z", 1.0), rec(2, "M", 1.0), rec(2, "A", 1.0)];
        let rows = compute_delta(&[], &after, d(1), d(2));
        let ids: Vec<&str> = rows.iter().map(|r| r.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "M", "Z"]);
        assert_eq!(rows[0].start_data_date, d(1));
    }

    #[test]
    fn test_delta_aggregates_repeated_sentinel() {
        let after = vec![rec(2, "None", 1.5), rec(2, "None", 2.5)];
        let rows = compute_delta(&[], &after, d(1), d(2));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change, 4.0);
    }

    #[test]
    fn test_rank_changes_by_threshold() {
        let rows = vec![delta("A", 3.0), delta("B", 0.4), delta("C", -0.5), delta("D", -2.0), delta("E", 0.5)];
        let ranked = rank_changes(&rows, 0.5);
        assert_eq!(changes(&ranked.gainers), vec![3.0, 0.5]);
        assert_eq!(changes(&ranked.losers), vec![-2.0, -0.5]);
    }

    #[test]
    fn test_counterparties_of_buyer() {
        let selected = delta("BUY", 10.0);
        let rows = vec![
            selected.clone(),
            delta("S3", -3.0),
            delta("S04", -0.4),
            delta("S6", -6.0),
            delta("S1", -1.0),
            delta("OTHER", 2.0),
        ];
        let matched = counterparty_match(&rows, &selected, 0.5);
        assert_eq!(changes(&matched), vec![-6.0, -3.0, -1.0]);
    }

    #[test]
    fn test_counterparties_stop_once_move_is_covered() {
        let selected = delta("BUY", 4.0);
        let rows = vec![delta("S1", -2.5), delta("S2", -2.1), delta("S3", -1.5), delta("S4", -1.0)];
        let matched = counterparty_match(&rows, &selected, 0.5);
        // both big movers already cover 4.6 ≥ 4.0
        assert_eq!(changes(&matched), vec![-2.5, -2.1]);
    }

    #[test]
    fn test_counterparties_of_seller_are_buyers() {
        let selected = delta("SELL", -5.0);
        let rows = vec![delta("B1", 1.0), delta("B2", 2.0), delta("B3", 1.5), delta("S", -3.0)];
        let matched = counterparty_match(&rows, &selected, 0.5);
        assert_eq!(changes(&matched), vec![2.0, 1.5, 1.0]);
        assert!(counterparty_match(&rows, &delta("FLAT", 0.0), 0.5).is_empty());
    }

    #[tokio::test]
    async fn test_engine_delta_uses_latest_snapshot_on_or_before() {
        let storage = Arc::new(StorageGateway::open_in_memory().unwrap());
        storage.initialise().await.unwrap();
        let rows = vec![rec(1, "A", 10.0), rec(3, "A", 12.0), rec(3, "B", 1.0)];
        storage.append_rows(RowBatch::Disclosures(&rows)).await.unwrap();

        let engine = AnalyticsEngine::new(storage, 10);
        let delta = engine.shareholding_delta("00001", d(2), d(5)).await.unwrap();
        assert_eq!(changes(&delta), vec![2.0, 1.0]);
        assert_eq!(delta[0].start_data_date, d(1));
        assert_eq!(delta[0].end_data_date, d(3));

        assert!(engine.shareholding_delta("09999", d(2), d(5)).await.unwrap().is_empty());
    }
}
