
use crate::error::ParseError;
use crate::models::{
    DisclosureRecord, NO_PARTICIPANT_ID, RawDisclosureRow, RawSecurityRow, SecurityNameRecord,
};
use chrono::NaiveDate;
use tracing::warn;

// ── Parsers ───────────────────────────────────────────────────────────────────

/// Parse a share count: strip thousands separators.
/// "1,234,567" → 1234567 | "0" → 0
pub fn parse_shareholding(s: &str) -> Result<i64, ParseError> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    let n: i64 = cleaned
        .parse()
        .map_err(|_| ParseError::InvalidNumber(s.trim().to_string()))?;
    if n < 0 {
        return Err(ParseError::InvalidNumber(s.trim().to_string()));
    }
    Ok(n)
}

/// "12.34%" → 12.34
pub fn parse_pct(s: &str) -> Result<f64, ParseError> {
    let cleaned = s.trim().replace(['%', ','], "");
    cleaned
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidNumber(s.trim().to_string()))
}

/// Numeric codes are left-padded to five digits: "5" → "00005".
pub fn normalise_stock_code(s: &str) -> String {
    let s = s.trim();
    if !s.is_empty() && s.len() < 5 && s.chars().all(|c| c.is_ascii_digit()) {
        format!("{:0>5}", s)
    } else {
        s.to_string()
    }
}

pub fn normalise_participant_name(s: &str) -> String {
    s.trim().replace(['\u{2018}', '\u{2019}', '`'], "'")
}

/// Stock names are stored as scraped; quotes are stripped for display only.
pub fn display_name(s: &str) -> String {
    s.replace(['"', '\u{201C}', '\u{201D}'], "").trim().to_string()
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

// ── Listing row → SecurityNameRecord ──────────────────────────────────────────

pub fn security_row_to_record(
    row: &RawSecurityRow,
    date: NaiveDate,
) -> Result<SecurityNameRecord, ParseError> {
    let code = non_empty(row.stock_code.as_deref()).ok_or(ParseError::MissingField("stock code"))?;
    let name = non_empty(row.stock_name.as_deref()).ok_or(ParseError::MissingField("stock name"))?;

    Ok(SecurityNameRecord {
        data_date: date,
        stock_code: normalise_stock_code(code),
        stock_name: name.to_string(),
    })
}

pub fn clean_security_rows(rows: Vec<RawSecurityRow>, date: NaiveDate) -> Vec<SecurityNameRecord> {
    rows.iter()
        .filter_map(|row| match security_row_to_record(row, date) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!("Dropping listing row {:?}: {}", row, e);
                None
            }
        })
        .collect()
}

// ── Disclosure rows → DisclosureRecord ────────────────────────────────────────

/// Convert raw disclosure rows for one (date, security).
///
/// When the page has no percentage column the fraction is derived from the
/// page total. Rows at or below `threshold` percent are dropped.
pub fn clean_disclosure_rows(
    date: NaiveDate,
    stock_code: &str,
    rows: Vec<RawDisclosureRow>,
    threshold: f64,
) -> Vec<DisclosureRecord> {
    let mut parsed = Vec::with_capacity(rows.len());

    for row in rows {
        let shareholding = match row
            .shareholding
            .as_deref()
            .ok_or(ParseError::MissingField("shareholding"))
            .and_then(parse_shareholding)
        {
            Ok(n) => n,
            Err(e) => {
                warn!("{} {}: dropping row: {}", stock_code, date, e);
                continue;
            }
        };

        let frac = match non_empty(row.frac_of_shares.as_deref()) {
            Some(s) => match parse_pct(s) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("{} {}: dropping row: {}", stock_code, date, e);
                    continue;
                }
            },
            None => None,
        };

        let participant_id = non_empty(row.participant_id.as_deref())
            .unwrap_or(NO_PARTICIPANT_ID)
            .to_string();

        parsed.push((row, participant_id, shareholding, frac));
    }

    let derive_frac = parsed.iter().any(|(_, _, _, frac)| frac.is_none());
    let total: i64 = parsed.iter().map(|(_, _, sh, _)| *sh).sum();

    parsed
        .into_iter()
        .map(|(row, participant_id, shareholding, frac)| {
            let frac_of_shares = match frac {
                Some(f) if !derive_frac => f,
                _ if total > 0 => shareholding as f64 / total as f64 * 100.0,
                _ => 0.0,
            };
            DisclosureRecord {
                data_date: date,
                stock_code: normalise_stock_code(stock_code),
                participant_id,
                participant_name: row
                    .participant_name
                    .as_deref()
                    .map(normalise_participant_name)
                    .unwrap_or_default(),
                participant_address: non_empty(row.participant_address.as_deref())
                    .map(str::to_string),
                shareholding,
                frac_of_shares,
            }
        })
        .filter(|rec| rec.frac_of_shares > threshold)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn d() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 6, 24).unwrap()
    }

    fn raw(id: &str, shares: &str, pct: Option<&str>) -> RawDisclosureRow {
        RawDisclosureRow {
            participant_id: Some(id.to_string()),
            participant_name: Some(format!("Participant {}", id)),
            participant_address: None,
            shareholding: Some(shares.to_string()),
            frac_of_shares: pct.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_shareholding() {
        assert_eq!(parse_shareholding("1,234,567").unwrap(), 1_234_567);
        assert_eq!(parse_shareholding(" 42 ").unwrap(), 42);
        assert!(parse_shareholding("-5").is_err());
        assert!(parse_shareholding("n/a").is_err());
    }

    #[test]
    fn test_parse_pct() {
        assert_eq!(parse_pct("12.34%").unwrap(), 12.34);
        assert_eq!(parse_pct("0.10%").unwrap(), 0.1);
        assert!(parse_pct("%").is_err());
    }

    #[test]
    fn test_normalise_stock_code() {
        assert_eq!(normalise_stock_code("5"), "00005");
        assert_eq!(normalise_stock_code(" 00700 "), "00700");
        assert_eq!(normalise_stock_code("A1234"), "A1234");
    }

    #[test]
    fn test_display_name_strips_quotes() {
        assert_eq!(display_name("\"CKH HOLDINGS\""), "CKH HOLDINGS");
        assert_eq!(display_name("\u{201C}HSBC\u{201D}"), "HSBC");
        assert_eq!(normalise_participant_name("MOODY\u{2019}S "), "MOODY'S");
    }

    #[test]
    fn test_threshold_is_strict() {
        let rows = vec![
            raw("A", "5", Some("0.05%")),
            raw("B", "10", Some("0.10%")),
            raw("C", "15", Some("0.15%")),
            raw("D", "5,000", Some("50.00%")),
        ];
        let recs = clean_disclosure_rows(d(), "00001", rows, 0.1);
        let fracs: Vec<f64> = recs.iter().map(|r| r.frac_of_shares).collect();
        assert_eq!(fracs, vec![0.15, 50.0]);
    }

    #[test]
    fn test_blank_participant_id_becomes_sentinel() {
        let mut row = raw("", "100", Some("1.00%"));
        row.participant_id = Some("   ".to_string());
        let recs = clean_disclosure_rows(d(), "1", vec![row], 0.1);
        assert_eq!(recs[0].participant_id, "None");
        assert_eq!(recs[0].stock_code, "00001");
    }

    #[test]
    fn test_fraction_derived_when_column_missing() {
        let rows = vec![raw("A", "750", None), raw("B", "250", None), raw("C", "0", None)];
        let recs = clean_disclosure_rows(d(), "00002", rows, 0.1);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].frac_of_shares, 75.0);
        assert_eq!(recs[1].frac_of_shares, 25.0);
    }

    #[test]
    fn test_unparseable_row_dropped_not_page() {
        let rows = vec![raw("A", "abc", Some("5%")), raw("B", "1,000", Some("5.5%"))];
        let recs = clean_disclosure_rows(d(), "00003", rows, 0.1);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].participant_id, "B");
        assert_eq!(recs[0].shareholding, 1000);
    }

    #[test]
    fn test_listing_rows_missing_fields_dropped() {
        let rows = vec![
            RawSecurityRow { stock_code: Some("00001".into()), stock_name: Some("CKH".into()) },
            RawSecurityRow { stock_code: Some("00002".into()), stock_name: None },
            RawSecurityRow { stock_code: Some(" ".into()), stock_name: Some("X".into()) },
        ];
        let recs = clean_security_rows(rows, d());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].stock_code, "00001");
    }
}
