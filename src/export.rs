//! CSV export of session history.
//!
//! Layout:
//!
//! ```text
//! Time (s),Line 1,Line 2,Line 3
//! 0.012,1.5,,3
//! 0.113,1.6,0.2,3
//! ```
//!
//! The header is as wide as the widest record. Shorter rows are padded with
//! empty cells and fields that failed to parse are written as empty cells.
//! An empty history still gets the label column header.
//! The first column is the label stored with each record, so the export
//! reproduces exactly what was shown live.

use crate::clock::SamplingMode;
use crate::error::AppResult;
use crate::record::Record;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `history` as CSV to `out`.
pub fn write_csv<W: Write>(out: W, history: &[Record], mode: SamplingMode) -> AppResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out);

    let width = history.iter().map(Record::width).max().unwrap_or(0);

    let mut header = Vec::with_capacity(width + 1);
    header.push(mode.column_title().to_string());
    header.extend((1..=width).map(|i| format!("Line {i}")));
    writer.write_record(&header)?;

    let mut row = Vec::with_capacity(width + 1);
    for record in history {
        row.clear();
        row.push(record.label.to_string());
        row.extend(
            record
                .fields
                .iter()
                .map(|field| field.map(|value| value.to_string()).unwrap_or_default()),
        );
        row.resize(width + 1, String::new());
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

/// Render `history` as a CSV string.
pub fn export_csv(history: &[Record], mode: SamplingMode) -> AppResult<String> {
    let mut out = Vec::new();
    write_csv(&mut out, history, mode)?;
    // Every cell is built from `String`s, so the bytes are UTF-8
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Default file name, e.g. `session_20250101_120000.csv`.
pub fn default_file_name() -> String {
    format!(
        "session_{}.csv",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    )
}

/// Write `history` to `path`, creating parent directories.
pub fn export_to_file(path: &Path, history: &[Record], mode: SamplingMode) -> AppResult<PathBuf> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    write_csv(file, history, mode)?;
    info!(path = %path.display(), records = history.len(), "History exported");
    Ok(path.to_path_buf())
}
