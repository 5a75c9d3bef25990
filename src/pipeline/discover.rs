//! Input discovery: turn the configured single PDF or input directory into
//! an ordered list of [`Document`]s.
//!
//! Directory scans are sorted by file name so that reruns visit documents in
//! the same order. A single-PDF override is validated by its `%PDF` magic
//! bytes up front, so the operator gets a clear error rather than a pdfium
//! failure later.

use crate::error::Spread2JsonError;
use crate::output::Document;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolve the batch's documents. `single` wins over `dir`.
pub fn discover_documents(
    single: Option<&Path>,
    dir: Option<&Path>,
) -> Result<Vec<Document>, Spread2JsonError> {
    if let Some(pdf) = single {
        check_pdf(pdf)?;
        debug!("Single PDF override: {}", pdf.display());
        return Ok(vec![Document::from_path(pdf)]);
    }

    let dir = dir.ok_or(Spread2JsonError::NoInput)?;
    if !dir.is_dir() {
        return Err(Spread2JsonError::InputNotFound {
            path: dir.to_path_buf(),
        });
    }

    let entries = std::fs::read_dir(dir).map_err(|_| Spread2JsonError::InputNotFound {
        path: dir.to_path_buf(),
    })?;

    let mut pdfs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_pdf_name(p))
        .collect();
    pdfs.sort();

    if pdfs.is_empty() {
        return Err(Spread2JsonError::NoPdfsFound {
            dir: dir.to_path_buf(),
        });
    }

    info!("Found {} PDF(s) in {}", pdfs.len(), dir.display());
    Ok(pdfs.into_iter().map(Document::from_path).collect())
}

fn is_pdf_name(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

/// Validate existence and PDF magic bytes.
fn check_pdf(path: &Path) -> Result<(), Spread2JsonError> {
    let mut f = std::fs::File::open(path).map_err(|_| Spread2JsonError::InputNotFound {
        path: path.to_path_buf(),
    })?;
    let mut magic = [0u8; 4];
    if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
        return Err(Spread2JsonError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}
