//! # spread2json
//!
//! Turn scanned double-page spreads into per-half-page JSON records.
//!
//! ## Why this crate?
//!
//! Archive scans (yearbooks, rosters, ledgers) are often captured two facing
//! pages at a time. OCR engines and multimodal models both do better on a
//! single page, and downstream consumers want one record file per printed
//! page. This crate cuts every spread down the middle, runs an external OCR
//! engine on each half, and asks a multimodal model to extract JSON from the
//! half-page PDF with the OCR HTML as context.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Discover  single PDF or sorted directory scan
//!  ├─ 2. Split     each page → left/right PDF + PNG (pdfium, spawn_blocking)
//!  ├─ 3. OCR       external engine per PNG → HTML (one run per device at a time)
//!  ├─ 4. Model     prompt + half PDF + HTML → response text (retry/backoff)
//!  └─ 5. JSON      extract, inject `year`, write <D>/<D>_pNN_s.json
//! ```
//!
//! Existing JSON files are never recomputed, so an interrupted batch resumes
//! where it stopped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spread2json::{run_batch, FileConfig, PipelineConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // api_key is read from the config file only
//!     let file = FileConfig::load(Path::new("spread2json.toml"))?;
//!     let config = PipelineConfig::builder().file_config(file).build()?;
//!     let report = run_batch(&config).await?;
//!     eprintln!(
//!         "{} written, {} skipped, {} failed",
//!         report.completed(),
//!         report.skipped(),
//!         report.failed()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `spread2json` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! spread2json = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod layout;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{FileConfig, PipelineConfig, PipelineConfigBuilder, DEFAULT_CONFIG_FILE};
pub use error::{
    HalfPageError, JsonExtractionError, ModelError, OcrError, SplitError, Spread2JsonError,
};
pub use layout::{HalfPageId, OutputLayout, Side};
pub use output::{
    BatchReport, Document, DocumentReport, HalfPageOutcome, HalfPageState, HalfPageStatus, PageInfo,
};
pub use pipeline::discover::discover_documents;
pub use pipeline::model::{GeminiClient, ModelClient, ModelRequest};
pub use pipeline::ocr::{CommandOcr, OcrEngine, OutputLocator, ScanLocator};
pub use pipeline::split::{PageSplitter, PdfiumSplitter, SplitTargets};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::{run_batch, DeviceLocks, Pipeline};
