//! Progress-callback trait for batch and half-page events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through documents and half-pages. The CLI
//! uses it to drive its progress bar and per-half-page status lines.
//!
//! # Example
//!
//! ```rust
//! use spread2json::{HalfPageId, PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_half_page_complete(&self, id: &HalfPageId, _json: &std::path::Path) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{id} done ({n} so far)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::layout::HalfPageId;
use crate::output::BatchReport;
use std::path::Path;
use std::sync::Arc;

/// Called by the pipeline as it processes documents and half-pages.
///
/// Implementations must be `Send + Sync`: with `concurrency > 1` the
/// half-page events of one document arrive from interleaved futures. All
/// methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once after input discovery.
    fn on_batch_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called when a document has been opened.
    ///
    /// `pending_half_pages` excludes half-pages skipped by resume.
    fn on_document_start(&self, document: &str, pages: usize, pending_half_pages: usize) {
        let _ = (document, pages, pending_half_pages);
    }

    /// Called when a document cannot be split; none of its pending
    /// half-pages will run.
    fn on_document_error(&self, document: &str, error: &str) {
        let _ = (document, error);
    }

    /// Called when a half-page's JSON already exists.
    fn on_half_page_skipped(&self, id: &HalfPageId) {
        let _ = id;
    }

    /// Called just before OCR starts for a half-page.
    fn on_half_page_start(&self, id: &HalfPageId) {
        let _ = id;
    }

    /// Called after the JSON artifact was written.
    fn on_half_page_complete(&self, id: &HalfPageId, json_path: &Path) {
        let _ = (id, json_path);
    }

    /// Called when a half-page fails; `error` is the full message.
    fn on_half_page_error(&self, id: &HalfPageId, error: &str) {
        let _ = (id, error);
    }

    /// Called once after every document has been attempted.
    fn on_batch_complete(&self, report: &BatchReport) {
        let _ = report;
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
