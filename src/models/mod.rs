use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Placeholder stored when the source leaves the participant id blank.
pub const NO_PARTICIPANT_ID: &str = "None";

// ── Disclosure record ─────────────────────────────────────────────────────────

/// One participant's holding of one security on one date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DisclosureRecord {
    pub data_date: NaiveDate,
    pub stock_code: String,
    #[serde(rename = "ParticipantID")]
    pub participant_id: String,
    pub participant_name: String,
    pub participant_address: Option<String>,
    pub shareholding: i64,
    pub frac_of_shares: f64,
}

// ── Security name map ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityNameRecord {
    pub data_date: NaiveDate,
    pub stock_code: String,
    pub stock_name: String,
}

// ── Read-side rows ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TrendRow {
    pub data_date: NaiveDate,
    #[serde(rename = "ParticipantID")]
    pub participant_id: String,
    pub participant_name: String,
    pub frac_of_shares: f64,
}

/// Change in a participant's holding between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DeltaRow {
    #[serde(rename = "ParticipantID")]
    pub participant_id: String,
    pub participant_name: String,
    pub start_data_date: NaiveDate,
    pub start_frac_of_shares: f64,
    pub end_data_date: NaiveDate,
    pub end_frac_of_shares: f64,
    #[serde(rename = "ChangeInPercentShares")]
    pub change: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ListedSecurity {
    pub stock_code: String,
    pub stock_name: String,
}

// ── Raw scraped rows ──────────────────────────────────────────────────────────

/// Security listing row: code, name
#[derive(Debug, Clone, Default)]
pub struct RawSecurityRow {
    pub stock_code: Option<String>,
    pub stock_name: Option<String>,
}

/// Disclosure table row. Older pages omit the percentage column.
#[derive(Debug, Clone, Default)]
pub struct RawDisclosureRow {
    pub participant_id: Option<String>,
    pub participant_name: Option<String>,
    pub participant_address: Option<String>,
    pub shareholding: Option<String>,
    pub frac_of_shares: Option<String>,
}
