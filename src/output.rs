//! Data model and run report types.

use crate::layout::{HalfPageId, Side};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// One source PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub path: PathBuf,
    /// File name without extension; injected verbatim as `year`.
    pub id: String,
}

impl Document {
    /// Derive the identifier from the file stem.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, id }
    }

    pub fn half_page(&self, page: usize, side: Side) -> HalfPageId {
        HalfPageId::new(self.id.clone(), page, side)
    }
}

/// Geometry of one source page, in PDF points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PageInfo {
    /// 1-based page number.
    pub index: usize,
    pub width: f32,
    pub height: f32,
}

/// Progress of a half-page through the pipeline.
///
/// `Pending → SplitDone → OcrDone → ModelDone`, then a terminal
/// [`HalfPageStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfPageState {
    Pending,
    SplitDone,
    OcrDone,
    ModelDone,
}

impl fmt::Display for HalfPageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HalfPageState::Pending => "PENDING",
            HalfPageState::SplitDone => "SPLIT_DONE",
            HalfPageState::OcrDone => "OCR_DONE",
            HalfPageState::ModelDone => "MODEL_DONE",
        };
        f.write_str(s)
    }
}

/// Terminal state of a half-page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HalfPageStatus {
    Complete { json_path: PathBuf },
    Skipped { json_path: PathBuf },
    Failed { reached: HalfPageState, error: String },
}

/// Result of one half-page.
#[derive(Debug, Clone, Serialize)]
pub struct HalfPageOutcome {
    #[serde(flatten)]
    pub id: HalfPageId,
    #[serde(flatten)]
    pub status: HalfPageStatus,
    pub duration_ms: u64,
    /// Model attempts beyond the first.
    pub retries: u32,
}

impl HalfPageOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, HalfPageStatus::Failed { .. })
    }
}

/// Result of one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub id: String,
    pub path: PathBuf,
    pub pages: usize,
    /// Set when the document could not be inspected or split. After a
    /// failed split its pending half-pages appear as failed in
    /// [`HalfPageState::Pending`].
    pub split_error: Option<String>,
    pub half_pages: Vec<HalfPageOutcome>,
}

impl DocumentReport {
    pub fn is_success(&self) -> bool {
        self.split_error.is_none() && !self.half_pages.iter().any(HalfPageOutcome::is_failed)
    }
}

/// Result of a whole batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub documents: Vec<DocumentReport>,
    pub total_duration_ms: u64,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&HalfPageStatus) -> bool) -> usize {
        self.documents
            .iter()
            .flat_map(|d| &d.half_pages)
            .filter(|o| pred(&o.status))
            .count()
    }

    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, HalfPageStatus::Complete { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, HalfPageStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, HalfPageStatus::Failed { .. }))
    }

    pub fn failed_documents(&self) -> usize {
        self.documents
            .iter()
            .filter(|d| d.split_error.is_some())
            .count()
    }

    /// True only if every half-page completed or was skipped and every
    /// document could be split. Drives the process exit status.
    pub fn is_success(&self) -> bool {
        self.documents.iter().all(DocumentReport::is_success)
    }
}
