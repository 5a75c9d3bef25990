//! Error types for the spread2json library.
//!
//! Errors are scoped by how much work they invalidate:
//!
//! * [`Spread2JsonError`]: **Fatal for the batch**: nothing useful can happen
//!   (no input, bad configuration, the OCR executable cannot be launched).
//!   Returned as `Err` from [`crate::run::Pipeline::run`].
//!
//! * [`SplitError`]: **Fatal for one document**: the source PDF cannot be
//!   parsed or rendered. Recorded in [`crate::output::DocumentReport`]; the
//!   batch continues with the next document.
//!
//! * [`HalfPageError`]: **Fatal for one half-page only**: OCR exit failure,
//!   model error, unparseable response. Recorded in
//!   [`crate::output::HalfPageOutcome`]; sibling half-pages are unaffected.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors that abort the whole batch.
#[derive(Debug, Error)]
pub enum Spread2JsonError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// A configured input path does not exist.
    #[error("Input not found: '{path}'\nCheck the path exists and is readable.")]
    InputNotFound { path: PathBuf },

    /// The single-PDF override exists but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The input directory contains no `*.pdf` files.
    #[error("No PDFs found in '{dir}'")]
    NoPdfsFound { dir: PathBuf },

    /// Neither a single PDF nor an input directory was configured.
    #[error("No input configured: set `single_pdf` or `input_dir` (or pass --pdf / --pdf-dir)")]
    NoInput,

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read or parsed.
    #[error("Failed to load config '{path}': {detail}")]
    ConfigRead { path: PathBuf, detail: String },

    /// The instruction prompt could not be read.
    #[error("Failed to read prompt '{path}': {detail}")]
    PromptRead { path: PathBuf, detail: String },

    // ── External tool errors ──────────────────────────────────────────────
    /// The OCR executable could not be started. Every further half-page
    /// would fail the same way, so the batch stops here.
    #[error("Failed to launch OCR engine '{program}': {detail}\nCheck `ocr_executable_path` (or --ocr).")]
    OcrLaunch { program: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set `pdfium_lib_path` in the config file or PDFIUM_LIB_PATH=/path/to/libpdfium,\n\
or install libpdfium where the system loader can find it.\n"
    )]
    PdfiumBindingFailed(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create the output directory tree.
    #[error("Failed to create output directory '{path}': {source}")]
    OutputDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A source PDF page could not be parsed, rendered or written out as halves.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Cannot open PDF '{path}': {detail}")]
    Load { path: PathBuf, detail: String },

    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    #[error("Page {page}: {detail}")]
    Render { page: usize, detail: String },

    #[error("Failed to write split output '{path}': {detail}")]
    Write { path: PathBuf, detail: String },

    #[error("pdfium unavailable: {0}")]
    Binding(String),
}

/// Failure of one OCR subprocess invocation.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The executable was not found or is not runnable.
    #[error("cannot launch '{program}': {detail}")]
    Launch { program: PathBuf, detail: String },

    /// The engine ran and exited unsuccessfully.
    #[error("OCR exited with {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },

    /// The engine exited successfully but no HTML file was produced.
    #[error("OCR produced no HTML in '{dir}'")]
    MissingOutput { dir: PathBuf },

    /// The engine did not exit within the configured timeout.
    #[error("OCR timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The output directory could not be created.
    #[error("Cannot prepare OCR directory '{path}': {detail}")]
    OutputDir { path: PathBuf, detail: String },

    /// The produced HTML file exists but could not be read.
    #[error("Cannot read OCR output '{path}': {detail}")]
    ReadOutput { path: PathBuf, detail: String },
}

impl OcrError {
    /// Launch failures indicate misconfiguration and abort the batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OcrError::Launch { .. })
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

/// Failure of one model request.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Transport, authentication, quota or server error.
    #[error("Model request failed{}: {detail}", status_label(.status))]
    Request { status: Option<u16>, detail: String },

    /// The request did not complete within the configured timeout.
    #[error("Model request timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The response contained no text.
    #[error("Model returned an empty response{}", reason_label(.reason))]
    EmptyResponse { reason: Option<String> },

    /// The half-page PDF could not be read for attachment.
    #[error("Cannot attach '{path}': {detail}")]
    Attachment { path: PathBuf, detail: String },
}

impl ModelError {
    /// Transport errors, timeouts, 429 and 5xx are worth retrying;
    /// auth failures and other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Request { status: None, .. } => true,
            ModelError::Request {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            ModelError::Timeout { .. } => true,
            ModelError::EmptyResponse { .. } | ModelError::Attachment { .. } => false,
        }
    }
}

fn status_label(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn reason_label(reason: &Option<String>) -> String {
    reason
        .as_ref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

/// No parseable JSON value could be found in a model response.
#[derive(Debug, Clone, Error)]
#[error("No valid JSON in model response: {reason}")]
pub struct JsonExtractionError {
    pub reason: String,
}

/// Any failure scoped to a single half-page.
#[derive(Debug, Error)]
pub enum HalfPageError {
    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Json(#[from] JsonExtractionError),

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
