//! Batch orchestration: documents → pages → half-pages → JSON files.
//!
//! ## Resume
//!
//! A half-page whose JSON file already exists is `SKIPPED` before any
//! component is invoked, unless `force` is set. Because JSON files are only
//! ever written complete (temp file + rename), an existing file is always a
//! finished result. A rerun over unchanged inputs therefore invokes neither
//! OCR nor the model.
//!
//! ## Failure scopes
//!
//! * A document that cannot be inspected or split is recorded with its
//!   `split_error`; the batch moves on to the next document. When the split
//!   itself fails, each pending half-page is reported as failed in
//!   `PENDING`.
//! * A half-page failure (OCR exit, model error, no JSON) is recorded in its
//!   outcome; siblings and later documents are unaffected.
//! * An OCR engine that cannot be launched aborts the batch, because every
//!   remaining half-page would fail the same way.
//!
//! ## Concurrency
//!
//! Documents run one after another. Within a document the pending
//! half-pages go through `buffer_unordered(concurrency)`; OCR calls are
//! serialised per device by [`DeviceLocks`] while model calls and
//! postprocessing overlap freely. Outcomes are returned as values and sorted
//! afterwards, so no state is shared between in-flight half-pages.

use crate::config::PipelineConfig;
use crate::error::{HalfPageError, OcrError, Spread2JsonError};
use crate::layout::{HalfPageId, OutputLayout, Side};
use crate::output::{
    BatchReport, Document, DocumentReport, HalfPageOutcome, HalfPageState, HalfPageStatus, PageInfo,
};
use crate::pipeline::discover::discover_documents;
use crate::pipeline::model::{analyze_with_retry, GeminiClient, ModelClient, ModelRequest};
use crate::pipeline::ocr::{CommandOcr, OcrEngine};
use crate::pipeline::postprocess::{postprocess, write_json_atomic};
use crate::pipeline::split::{PageSplitter, PdfiumSplitter, SplitTargets};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::load_prompt;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-device OCR exclusion: at most one engine run per device at a time.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    /// Wait until `device` is free and hold it until the guard drops.
    pub async fn acquire(&self, device: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(device.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Immutable descriptor of one pending half-page.
#[derive(Debug, Clone)]
struct WorkItem {
    id: HalfPageId,
    pdf: PathBuf,
    png: PathBuf,
    ocr_dir: PathBuf,
    json: PathBuf,
}

impl WorkItem {
    fn new(layout: &OutputLayout, id: HalfPageId) -> Self {
        Self {
            pdf: layout.half_pdf(&id),
            png: layout.half_png(&id),
            ocr_dir: layout.ocr_dir(&id),
            json: layout.json_path(&id),
            id,
        }
    }
}

/// The orchestrator, generic over its three external components.
pub struct Pipeline<S, O, M> {
    splitter: S,
    ocr: O,
    model: M,
    layout: OutputLayout,
    prompt: String,
    device: String,
    model_id: String,
    concurrency: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
    force: bool,
    progress: ProgressCallback,
    device_locks: DeviceLocks,
}

impl<S: PageSplitter, O: OcrEngine, M: ModelClient> Pipeline<S, O, M> {
    pub fn new(config: &PipelineConfig, prompt: String, splitter: S, ocr: O, model: M) -> Self {
        Self {
            splitter,
            ocr,
            model,
            layout: OutputLayout::new(&config.output_dir),
            prompt,
            device: config.device.clone(),
            model_id: config.model_id.clone(),
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            force: config.force,
            progress: config
                .progress_callback
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProgressCallback)),
            device_locks: DeviceLocks::default(),
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Process every document in order.
    ///
    /// Returns `Err` only for batch-fatal conditions; per-document and
    /// per-half-page failures are in the report.
    pub async fn run(&self, documents: &[Document]) -> Result<BatchReport, Spread2JsonError> {
        let start = Instant::now();
        let root = self.layout.root();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| Spread2JsonError::OutputDirFailed {
                path: root.to_path_buf(),
                source,
            })?;

        self.progress.on_batch_start(documents.len());
        let mut report = BatchReport::default();
        for document in documents {
            report.documents.push(self.process_document(document).await?);
        }
        report.total_duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Batch complete: {} completed, {} skipped, {} failed, {} document(s) unsplittable, {}ms",
            report.completed(),
            report.skipped(),
            report.failed(),
            report.failed_documents(),
            report.total_duration_ms
        );
        self.progress.on_batch_complete(&report);
        Ok(report)
    }

    async fn process_document(&self, document: &Document) -> Result<DocumentReport, Spread2JsonError> {
        info!("Processing {} ({})", document.id, document.path.display());
        let mut report = DocumentReport {
            id: document.id.clone(),
            path: document.path.clone(),
            pages: 0,
            split_error: None,
            half_pages: Vec::new(),
        };

        let pages = match self.splitter.pages(&document.path).await {
            Ok(pages) => pages,
            Err(e) => {
                self.record_split_failure(&mut report, e.to_string());
                return Ok(report);
            }
        };
        report.pages = pages.len();

        // ── Resume check ─────────────────────────────────────────────────
        let mut pending = Vec::new();
        for page in &pages {
            for side in Side::BOTH {
                let id = document.half_page(page.index, side);
                let json_path = self.layout.json_path(&id);
                if !self.force && json_path.is_file() {
                    debug!(half_page = %id, "SKIPPED: {} exists", json_path.display());
                    self.progress.on_half_page_skipped(&id);
                    report.half_pages.push(HalfPageOutcome {
                        id,
                        status: HalfPageStatus::Skipped { json_path },
                        duration_ms: 0,
                        retries: 0,
                    });
                } else {
                    pending.push(WorkItem::new(&self.layout, id));
                }
            }
        }
        self.progress
            .on_document_start(&document.id, pages.len(), pending.len());

        // ── Split ────────────────────────────────────────────────────────
        let to_split: BTreeSet<usize> = pending.iter().map(|item| item.id.page).collect();
        let to_split: Vec<PageInfo> = pages
            .iter()
            .filter(|p| to_split.contains(&p.index))
            .copied()
            .collect();
        if let Err(e) = self.split_pages(document, &to_split).await {
            // pending half-pages never left PENDING
            report
                .half_pages
                .extend(pending.into_iter().map(|item| HalfPageOutcome {
                    id: item.id,
                    status: HalfPageStatus::Failed {
                        reached: HalfPageState::Pending,
                        error: e.clone(),
                    },
                    duration_ms: 0,
                    retries: 0,
                }));
            report.half_pages.sort_by(|a, b| a.id.cmp(&b.id));
            self.record_split_failure(&mut report, e);
            return Ok(report);
        }

        // ── Half-pages ───────────────────────────────────────────────────
        let processed: Vec<HalfPageOutcome> = stream::iter(
            pending
                .into_iter()
                .map(|item| self.process_half_page(item)),
        )
        .buffer_unordered(self.concurrency)
        .try_collect()
        .await?;

        report.half_pages.extend(processed);
        report.half_pages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(report)
    }

    /// Split `pages` up front; on failure remove everything this pass wrote.
    async fn split_pages(&self, document: &Document, pages: &[PageInfo]) -> Result<(), String> {
        let mut written: Vec<PathBuf> = Vec::new();
        for page in pages {
            let targets = SplitTargets::new(&self.layout, document, page.index);
            written.extend(targets.paths().iter().map(|p| p.to_path_buf()));
            if let Err(e) = self
                .splitter
                .split_page(&document.path, *page, &targets)
                .await
            {
                for path in &written {
                    if tokio::fs::remove_file(path).await.is_ok() {
                        debug!("Removed partial split output {}", path.display());
                    }
                }
                return Err(e.to_string());
            }
            debug!("{}: page {} split", document.id, page.index);
        }
        Ok(())
    }

    fn record_split_failure(&self, report: &mut DocumentReport, error: String) {
        warn!("{}: cannot split: {}", report.id, error);
        self.progress.on_document_error(&report.id, &error);
        report.split_error = Some(error);
    }

    async fn process_half_page(&self, item: WorkItem) -> Result<HalfPageOutcome, Spread2JsonError> {
        let start = Instant::now();
        self.progress.on_half_page_start(&item.id);

        let mut state = HalfPageState::SplitDone;
        let mut retries = 0;
        debug!(half_page = %item.id, "{state}");
        let result = self.run_stages(&item, &mut state, &mut retries).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let status = match result {
            Ok(()) => {
                info!(half_page = %item.id, "Wrote {}", item.json.display());
                self.progress.on_half_page_complete(&item.id, &item.json);
                HalfPageStatus::Complete {
                    json_path: item.json,
                }
            }
            Err(HalfPageError::Ocr(OcrError::Launch { program, detail })) => {
                return Err(Spread2JsonError::OcrLaunch { program, detail });
            }
            Err(e) => {
                let error = e.to_string();
                warn!(half_page = %item.id, reached = %state, "FAILED: {error}");
                self.progress.on_half_page_error(&item.id, &error);
                HalfPageStatus::Failed {
                    reached: state,
                    error,
                }
            }
        };

        Ok(HalfPageOutcome {
            id: item.id,
            status,
            duration_ms,
            retries,
        })
    }

    async fn run_stages(
        &self,
        item: &WorkItem,
        state: &mut HalfPageState,
        retries: &mut u32,
    ) -> Result<(), HalfPageError> {
        let html = {
            let _device = self.device_locks.acquire(&self.device).await;
            self.ocr
                .run_ocr(&item.png, &item.ocr_dir, &self.device)
                .await?
        };
        *state = HalfPageState::OcrDone;
        debug!(half_page = %item.id, "{state}: {} bytes of HTML", html.len());

        let request = ModelRequest {
            pdf_path: &item.pdf,
            html_text: &html,
            prompt_text: &self.prompt,
            model_id: &self.model_id,
        };
        let (response, spent) =
            analyze_with_retry(&self.model, &request, self.max_retries, self.retry_backoff_ms)
                .await;
        *retries = spent;
        let raw = response?;
        *state = HalfPageState::ModelDone;
        debug!(half_page = %item.id, "{state}");

        let bytes = postprocess(&raw, &item.id.document)?;
        write_json_atomic(&item.json, &bytes)
            .await
            .map_err(|source| HalfPageError::Write {
                path: item.json.clone(),
                source,
            })
    }
}

/// Run a batch with the production components: pdfium, the configured OCR
/// executable and Gemini.
pub async fn run_batch(config: &PipelineConfig) -> Result<BatchReport, Spread2JsonError> {
    let documents = discover_documents(config.single_pdf.as_deref(), config.input_dir.as_deref())?;
    let prompt = load_prompt(&config.prompt_path).await?;

    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            Spread2JsonError::InvalidConfig("`api_key` is not set in the config file".into())
        })?;

    let splitter = PdfiumSplitter::new(
        config.dpi,
        config.max_rendered_pixels,
        config.pdfium_lib_path.clone(),
    );
    let binding = splitter.clone();
    tokio::task::spawn_blocking(move || binding.check_binding())
        .await
        .map_err(|e| Spread2JsonError::Internal(format!("pdfium binding check panicked: {e}")))?
        .map_err(Spread2JsonError::PdfiumBindingFailed)?;

    let mut ocr = CommandOcr::new(&config.ocr_executable);
    if let Some(secs) = config.ocr_timeout_secs {
        ocr = ocr.with_timeout(Duration::from_secs(secs));
    }

    let model = GeminiClient::new(
        api_key,
        &config.api_base,
        Duration::from_secs(config.api_timeout_secs),
    )
    .map_err(|e| Spread2JsonError::Internal(format!("cannot build HTTP client: {e}")))?
    .with_temperature(config.temperature)
    .with_max_output_tokens(config.max_output_tokens);

    Pipeline::new(config, prompt, splitter, ocr, model)
        .run(&documents)
        .await
}
