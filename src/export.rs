use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::catalog::{format_timestamp, Catalog, RecordFilter};
use crate::model::ImageRecord;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unsupported export format: {}", other)),
        }
    }
}

const CSV_HEADERS: [&str; 16] = [
    "record_id",
    "provider",
    "provider_native_id",
    "content_hash",
    "perceptual_hash",
    "storage_path",
    "width",
    "height",
    "label",
    "quality_flags",
    "ingested_at",
    "source_url",
    "content_type",
    "byte_size",
    "search_query",
    "query_tags",
];

/// Export catalog records matching `filter` to a file. Returns the row count.
///
/// Records are streamed from the catalog in batches, so exports of any size
/// run in bounded memory. Rows come out in record id order.
pub fn export_records(
    catalog: &Catalog,
    filter: RecordFilter,
    output_path: &Path,
    format: ExportFormat,
) -> Result<usize> {
    let records = catalog.query(filter);
    let count = match format {
        ExportFormat::Json => export_json(records, output_path)?,
        ExportFormat::Csv => export_csv(records, output_path)?,
    };
    Ok(count)
}

fn export_json<I, E>(records: I, output_path: &Path) -> Result<usize>
where
    I: Iterator<Item = Result<ImageRecord, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    let mut out = BufWriter::new(file);

    out.write_all(b"[")?;
    let mut count = 0;
    for record in records {
        let record = record?;
        let sep: &[u8] = if count == 0 { b"\n  " } else { b",\n  " };
        out.write_all(sep)?;
        serde_json::to_writer(&mut out, &record)?;
        count += 1;
    }
    let close: &[u8] = if count == 0 { b"]\n" } else { b"\n]\n" };
    out.write_all(close)?;
    out.flush()?;
    Ok(count)
}

fn export_csv<I, E>(records: I, output_path: &Path) -> Result<usize>
where
    I: Iterator<Item = Result<ImageRecord, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut wtr = csv::Writer::from_path(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    wtr.write_record(CSV_HEADERS)?;

    let mut count = 0;
    for record in records {
        let record = record?;
        let width = record.width.to_string();
        let height = record.height.to_string();
        let flags = serde_json::to_string(&record.quality_flags)?;
        let ingested_at = format_timestamp(&record.ingested_at);
        let byte_size = record.byte_size.map(|v| v.to_string()).unwrap_or_default();
        let tags = record.query_tags.join(";");
        wtr.write_record([
            record.record_id.as_str(),
            record.provider.as_str(),
            record.provider_native_id.as_str(),
            record.content_hash.as_str(),
            record.perceptual_hash.as_str(),
            record.storage_path.as_str(),
            width.as_str(),
            height.as_str(),
            record.label.as_str(),
            flags.as_str(),
            ingested_at.as_str(),
            record.source_url.as_deref().unwrap_or(""),
            record.content_type.as_deref().unwrap_or(""),
            byte_size.as_str(),
            record.search_query.as_deref().unwrap_or(""),
            tags.as_str(),
        ])?;
        count += 1;
    }

    wtr.flush()?;
    Ok(count)
}
