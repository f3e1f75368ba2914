use crate::error::ParseError;
use crate::models::{DisclosureRecord, RawDisclosureRow, RawSecurityRow, SecurityNameRecord};
use crate::scraper::cleaner::{clean_disclosure_rows, clean_security_rows};
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use tracing::debug;

/// Container around the per-participant table on a search result page.
pub const DISCLOSURE_TABLE_SELECTOR: &str =
    ".search-details-table-container.table-mobile-list-container";

fn selector(s: &str) -> Result<Selector, ParseError> {
    Selector::parse(s).map_err(|_| ParseError::Selector(s.to_string()))
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// True when the document contains at least one element matching `css`.
pub fn has_element(html: &str, css: &str) -> Result<bool, ParseError> {
    let sel = selector(css)?;
    Ok(Html::parse_document(html).select(&sel).next().is_some())
}

// ── Security list page ────────────────────────────────────────────────────────

/// Raw rows of the first table, header row skipped, at most `max_rows`.
pub fn extract_security_rows(html: &str, max_rows: usize) -> Result<Vec<RawSecurityRow>, ParseError> {
    let doc = Html::parse_document(html);
    let table_sel = selector("table")?;
    let tr_sel = selector("tr")?;
    let td_sel = selector("td")?;

    let Some(table) = doc.select(&table_sel).next() else {
        return Ok(vec![]);
    };

    let rows = table
        .select(&tr_sel)
        .skip(1)
        .take(max_rows)
        .map(|tr| {
            let cells: Vec<String> = tr.select(&td_sel).map(cell_text).collect();
            RawSecurityRow {
                stock_code: cells.first().cloned(),
                stock_name: cells.get(1).cloned(),
            }
        })
        .collect();

    Ok(rows)
}

pub fn parse_security_list(
    html: &str,
    date: NaiveDate,
    max_rows: usize,
) -> Result<Vec<SecurityNameRecord>, ParseError> {
    let raw = extract_security_rows(html, max_rows)?;
    Ok(clean_security_rows(raw, date))
}

// ── Disclosure result page ────────────────────────────────────────────────────

/// Raw rows of the disclosure table, `None` when the page has no such table.
///
/// Cells are the `.mobile-list-body` divs; their count on the first data row
/// decides whether the percentage column is present.
pub fn extract_disclosure_rows(html: &str) -> Result<Option<Vec<RawDisclosureRow>>, ParseError> {
    let doc = Html::parse_document(html);
    let container_sel = selector(DISCLOSURE_TABLE_SELECTOR)?;
    let tr_sel = selector("tr")?;
    let body_sel = selector("div.mobile-list-body")?;

    let Some(container) = doc.select(&container_sel).next() else {
        return Ok(None);
    };

    let rows: Vec<Vec<String>> = container
        .select(&tr_sel)
        .skip(1)
        .map(|tr| tr.select(&body_sel).map(cell_text).collect::<Vec<_>>())
        .filter(|cells| !cells.is_empty())
        .collect();

    let width = rows.first().map(Vec::len).unwrap_or(0);
    let has_pct = width >= 5;

    let raw = rows
        .into_iter()
        .map(|cells| RawDisclosureRow {
            participant_id: cells.first().cloned(),
            participant_name: cells.get(1).cloned(),
            participant_address: cells.get(2).cloned(),
            shareholding: cells.get(3).cloned(),
            frac_of_shares: if has_pct { cells.get(4).cloned() } else { None },
        })
        .collect();

    Ok(Some(raw))
}

/// Typed rows above `threshold`; empty when the page carries no table.
pub fn parse_disclosure_table(
    html: &str,
    date: NaiveDate,
    stock_code: &str,
    threshold: f64,
) -> Result<Vec<DisclosureRecord>, ParseError> {
    match extract_disclosure_rows(html)? {
        Some(raw) => Ok(clean_disclosure_rows(date, stock_code, raw, threshold)),
        None => {
            debug!("{} {}: no disclosure table", stock_code, date);
            Ok(vec![])
        }
    }
}

// ── Search form ───────────────────────────────────────────────────────────────

/// Name → value of every named `<input>` in the page's form, hidden state included.
pub fn extract_form_fields(html: &str) -> Result<HashMap<String, String>, ParseError> {
    let doc = Html::parse_document(html);
    let input_sel = selector("form input[name]")?;

    Ok(doc
        .select(&input_sel)
        .filter(|el| {
            let kind = el.value().attr("type").unwrap_or("text");
            !matches!(kind, "submit" | "button" | "image")
        })
        .filter_map(|el| {
            let name = el.value().attr("name")?;
            let value = el.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect())
}

/// `name` attribute of the element with the given id.
pub fn input_name_by_id(html: &str, id: &str) -> Result<Option<String>, ParseError> {
    let doc = Html::parse_document(html);
    let sel = selector(&format!("#{}", id))?;
    Ok(doc
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("name"))
        .map(str::to_string))
}
