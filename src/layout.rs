//! Deterministic on-disk layout for every half-page artifact.
//!
//! Every path is a pure function of (document id, page number, side); there
//! are no timestamps or random components. That is what makes resume work:
//! if [`OutputLayout::json_path`] exists, the half-page is done.
//!
//! ```text
//! <root>/<D>/pdf_pages/<D>_p<NN>_<L|R>.pdf
//! <root>/<D>/pdf_pages/<D>_p<NN>_<L|R>.png
//! <root>/<D>/p<NN>_<l|r>/                  OCR HTML directory
//! <root>/<D>/<D>_p<NN>_<l|r>.json          final artifact
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which half of a spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Both sides in processing order.
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    /// Uppercase letter used in split file names (`_L.pdf`).
    pub fn file_letter(self) -> char {
        match self {
            Side::Left => 'L',
            Side::Right => 'R',
        }
    }

    /// Lowercase letter used for OCR directories and JSON names (`_l.json`).
    pub fn artifact_letter(self) -> char {
        match self {
            Side::Left => 'l',
            Side::Right => 'r',
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// Identity of one half-page: the unit of work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HalfPageId {
    pub document: String,
    /// 1-based page number.
    pub page: usize,
    pub side: Side,
}

impl HalfPageId {
    pub fn new(document: impl Into<String>, page: usize, side: Side) -> Self {
        Self {
            document: document.into(),
            page,
            side,
        }
    }

    /// `p03_l`: names the OCR directory and, prefixed, the JSON file.
    pub fn label(&self) -> String {
        format!("p{:02}_{}", self.page, self.side.artifact_letter())
    }

    /// `2024_p03_L`: basename of the split PDF/PNG.
    pub fn split_basename(&self) -> String {
        format!(
            "{}_p{:02}_{}",
            self.document,
            self.page,
            self.side.file_letter()
        )
    }
}

impl fmt::Display for HalfPageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.document, self.label())
    }
}

/// Root of the output tree.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_dir(&self, document: &str) -> PathBuf {
        self.root.join(document)
    }

    pub fn pdf_pages_dir(&self, document: &str) -> PathBuf {
        self.document_dir(document).join("pdf_pages")
    }

    pub fn half_pdf(&self, id: &HalfPageId) -> PathBuf {
        self.pdf_pages_dir(&id.document)
            .join(format!("{}.pdf", id.split_basename()))
    }

    pub fn half_png(&self, id: &HalfPageId) -> PathBuf {
        self.pdf_pages_dir(&id.document)
            .join(format!("{}.png", id.split_basename()))
    }

    pub fn ocr_dir(&self, id: &HalfPageId) -> PathBuf {
        self.document_dir(&id.document).join(id.label())
    }

    pub fn json_path(&self, id: &HalfPageId) -> PathBuf {
        self.document_dir(&id.document)
            .join(format!("{}_{}.json", id.document, id.label()))
    }
}
