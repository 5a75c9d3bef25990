//! Pipeline stages for spread-to-JSON extraction.
//!
//! Each submodule implements exactly one step. The three stages that talk to
//! the outside world sit behind traits ([`split::PageSplitter`],
//! [`ocr::OcrEngine`], [`model::ModelClient`]) so the orchestrator in
//! [`crate::run`] can be driven by test doubles.
//!
//! ## Data Flow
//!
//! ```text
//! discover ──▶ split ──▶ ocr ──▶ model ──▶ postprocess
//! (PDF list)  (pdfium)  (subproc) (Gemini)  (JSON + year)
//! ```
//!
//! 1. [`discover`]: single-PDF override or sorted directory scan
//! 2. [`split`]: halve each page into PDFs and PNG rasters; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`ocr`]: run the OCR executable on a PNG and read back its HTML
//! 4. [`model`]: one multimodal request (prompt + PDF + HTML) with
//!    retry/backoff; [`encode`] prepares the PDF attachment
//! 5. [`postprocess`]: pull the JSON out of the response, inject `year`,
//!    render deterministically and write atomically

pub mod discover;
pub mod encode;
pub mod model;
pub mod ocr;
pub mod postprocess;
pub mod split;
