//! Record-oriented output for query results.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON array of records
    #[default]
    Json,
    /// CSV with a header row
    Csv,
}

pub fn write_records<T: Serialize, W: Write>(rows: &[T], format: OutputFormat, mut out: W) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, rows).context("Failed to write JSON")?;
            writeln!(out)?;
        }
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(out);
            for row in rows {
                wtr.serialize(row).context("Failed to write CSV row")?;
            }
            wtr.flush()?;
        }
    }
    Ok(())
}

/// A single JSON document; CSV callers flatten to rows first.
pub fn write_json<T: Serialize, W: Write>(value: &T, mut out: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, value).context("Failed to write JSON")?;
    writeln!(out)?;
    Ok(())
}
