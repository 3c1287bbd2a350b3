//! Output plumbing for oncolat runs: TSV table assembly and gzip-aware
//! file writing. Every table is tab-separated with `.` as the decimal
//! separator; a file whose name ends in `.gz` is gzip-compressed on write.

use flate2::Compression;
use flate2::write::GzEncoder;
use oncolat_core::{CELL_TSV_HEADER, DriverRecord, Tissue};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Run output directory; created on construction.
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    /// Create `root` (and parents) if missing.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write `contents` under `name`, gzip-compressed when the name ends
    /// in `.gz`. Returns the full path written.
    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf, StorageError> {
        let path = self.root.join(name);
        let result = if name.ends_with(".gz") {
            write_gzip(&path, contents)
        } else {
            fs::write(&path, contents)
        };
        result.map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

fn write_gzip(path: &Path, contents: &str) -> io::Result<()> {
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(contents.as_bytes())?;
    encoder.finish()?;
    Ok(())
}

/// One row per cell ever recorded: history first, then the extant
/// population.
#[must_use]
pub fn population_tsv(tissue: &Tissue) -> String {
    let mut out = String::with_capacity(64 * (tissue.population().count() + 1));
    out.push_str(CELL_TSV_HEADER);
    out.push('\n');
    for cell in tissue.population() {
        out.push_str(&cell.tsv_row());
        out.push('\n');
    }
    out
}

/// Time-prefixed cell rows captured at the configured snapshot instants.
#[must_use]
pub fn snapshots_tsv(tissue: &Tissue) -> String {
    let mut out = format!("time\t{CELL_TSV_HEADER}\n");
    for row in tissue.snapshots() {
        let _ = writeln!(out, "{}\t{}", row.time, row.cell.tsv_row());
    }
    out
}

/// Driver-mutation log in division order.
#[must_use]
pub fn drivers_tsv(records: &[DriverRecord]) -> String {
    let mut out = String::from("id\ttype\tcoef\n");
    for record in records {
        let _ = writeln!(out, "{}\t{}\t{}", record.cell_id, record.kind, record.coef);
    }
    out
}
