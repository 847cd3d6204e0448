//! Tabular export of a dataset: CSV for spreadsheets, JSON for scripts,
//! and an aligned text table for the terminal.

use crate::dataset::Dataset;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Csv,
    Json,
    Table,
}

impl Format {
    /// Guess the format from an output file extension.
    pub fn from_extension(path: &Path) -> Option<Format> {
        match path.extension()?.to_str()? {
            "csv" => Some(Format::Csv),
            "json" => Some(Format::Json),
            "txt" => Some(Format::Table),
            _ => None,
        }
    }
}

pub fn write_dataset(
    dataset: &Dataset,
    format: Format,
    out: &mut impl Write,
) -> Result<(), ExportError> {
    match format {
        Format::Csv => write_csv(dataset, out),
        Format::Json => {
            serde_json::to_writer_pretty(&mut *out, dataset)
                .map_err(|e| ExportError::Json { source: e })?;
            writeln!(out)?;
            Ok(())
        }
        Format::Table => write_table(&dataset.columns(), &rows(dataset), out),
    }
}

/// Write to `path` through a temp file in the same directory, so a reader
/// never sees a half-written export.
pub fn write_to_path(dataset: &Dataset, format: Format, path: &Path) -> Result<(), ExportError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    write_dataset(dataset, format, tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.persist(path).map_err(|e| ExportError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    tracing::info!(path = %path.display(), rows = dataset.len(), "wrote dataset");
    Ok(())
}

/// Cells as strings, one row per record, aligned to `columns()`. Absent cells are empty.
fn rows(dataset: &Dataset) -> Vec<Vec<String>> {
    let columns = dataset.columns();
    dataset
        .records()
        .iter()
        .map(|r| {
            columns
                .iter()
                .map(|c| r.get(c).map(|v| v.to_string()).unwrap_or_default())
                .collect()
        })
        .collect()
}

fn write_csv(dataset: &Dataset, out: &mut impl Write) -> Result<(), ExportError> {
    let columns = dataset.columns();
    if columns.is_empty() {
        return Ok(());
    }
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(&columns)?;
    for row in rows(dataset) {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Whitespace-aligned table, cells right-aligned under their headers.
pub(crate) fn write_table(
    header: &[String],
    rows: &[Vec<String>],
    out: &mut impl Write,
) -> Result<(), ExportError> {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.len());
            }
        }
    }

    let line = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, &w)| format!("{c:>w$}"))
            .collect::<Vec<_>>()
            .join("  ")
    };
    writeln!(out, "{}", line(header))?;
    for row in rows {
        writeln!(out, "{}", line(&row[..]))?;
    }
    Ok(())
}

#[derive(Debug)]
pub enum ExportError {
    Io(std::io::Error),
    Csv {
        source: csv::Error,
    },
    Json {
        source: serde_json::Error,
    },
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Io(e) => write!(f, "I/O error during export: {e}"),
            ExportError::Csv { source } => write!(f, "failed to write CSV: {source}"),
            ExportError::Json { source } => write!(f, "failed to serialize dataset: {source}"),
            ExportError::Persist { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Io(e) => Some(e),
            ExportError::Csv { source } => Some(source),
            ExportError::Json { source } => Some(source),
            ExportError::Persist { source, .. } => Some(source),
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::Io(e)
    }
}

impl From<csv::Error> for ExportError {
    fn from(e: csv::Error) -> Self {
        ExportError::Csv { source: e }
    }
}
