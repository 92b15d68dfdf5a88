//! Zip packing of bundled downloads.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use anyhow::Context;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::AppResult;
use crate::models::BundleOutcome;

/// Name of the per-file report stored inside every bundle.
pub const REPORT_ENTRY: &str = "bundle-report.json";

/// Strip path separators and control characters so entries stay at the archive root.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ').to_string();

    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Pack the successful files plus [`REPORT_ENTRY`] into a zip archive.
pub fn pack(outcome: &BundleOutcome) -> AppResult<Vec<u8>> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut used = HashSet::new();
    used.insert(REPORT_ENTRY.to_string());

    for (payload, bundled) in outcome.files.iter().zip(outcome.report.succeeded.iter()) {
        let mut name = sanitize_filename(&payload.filename);
        if !used.insert(name.clone()) {
            name = format!("{}-{}", sanitize_filename(&bundled.file_id), name);
            used.insert(name.clone());
        }

        zip.start_file(name.as_str(), options)
            .with_context(|| format!("Failed to add {} to bundle", name))?;
        zip.write_all(&payload.bytes)
            .with_context(|| format!("Failed to write {} to bundle", name))?;
    }

    let report = serde_json::to_vec_pretty(&outcome.report).context("Failed to encode bundle report")?;
    zip.start_file(REPORT_ENTRY, options)
        .context("Failed to add bundle report")?;
    zip.write_all(&report).context("Failed to write bundle report")?;

    let cursor = zip.finish().context("Failed to finish bundle")?;
    Ok(cursor.into_inner())
}
