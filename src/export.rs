//! CSV download of a predicate's rows.

use crate::error::ExportError;
use crate::worker::WorkerHandle;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait PredicateExporter: Send + Sync {
    /// Write every row of `predicate` somewhere and return where it went.
    async fn download_predicate(
        &self,
        handle: &dyn WorkerHandle,
        predicate: &str,
    ) -> Result<PathBuf, ExportError>;
}

pub struct CsvExporter {
    dir: PathBuf,
    page_size: usize,
}

impl CsvExporter {
    pub fn new(dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            dir: dir.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn path_for(&self, predicate: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", file_stem(predicate)))
    }
}

/// Keep predicate names usable as file names on every platform.
fn file_stem(predicate: &str) -> String {
    let stem: String = predicate
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.trim_matches('.').is_empty() {
        "predicate".to_string()
    } else {
        stem
    }
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

pub(crate) fn csv_lines(rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    for row in rows {
        for (i, field) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            push_field(&mut out, field);
        }
        out.push('\n');
    }
    out
}

/// Write via a sibling temp file so a failed export never leaves a truncated CSV.
fn write_atomic(path: &Path, contents: &str) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("csv.part");
    let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[async_trait]
impl PredicateExporter for CsvExporter {
    async fn download_predicate(
        &self,
        handle: &dyn WorkerHandle,
        predicate: &str,
    ) -> Result<PathBuf, ExportError> {
        let mut contents = String::new();
        let mut offset = 0;
        loop {
            let page = handle
                .predicate_rows(predicate, offset, self.page_size)
                .await
                .map_err(|source| ExportError::Rows {
                    predicate: predicate.to_string(),
                    source,
                })?;
            contents.push_str(&csv_lines(&page));
            offset += page.len();
            if page.len() < self.page_size {
                break;
            }
        }

        let path = self.path_for(predicate);
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &contents))
            .await
            .map_err(|e| ExportError::Io {
                path: path.clone(),
                source: std::io::Error::other(e),
            })??;
        tracing::info!(predicate, rows = offset, path = %path.display(), "predicate exported");
        Ok(path)
    }
}
