//! Orchestrator integration tests.
//!
//! The splitter, OCR engine and model are replaced by in-process doubles so
//! these tests need neither pdfium, an OCR install nor network access. The
//! doubles write real files under a temp directory, so resume, atomic output
//! and cleanup behave exactly as in production.

use spread2json::{
    BatchReport, Document, HalfPageId, HalfPageState, HalfPageStatus, ModelClient, ModelError,
    ModelRequest, OcrEngine, OcrError, PageInfo, PageSplitter, Pipeline, PipelineConfig,
    PipelineProgressCallback, Side, SplitError, SplitTargets, Spread2JsonError,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ALICE: &str = r#"{"data":[{"name":"Alice"}]}"#;
const ALICE_2024: &str =
    "{\n  \"year\": \"2024\",\n  \"data\": [\n    {\n      \"name\": \"Alice\"\n    }\n  ]\n}\n";

// ── Test doubles ─────────────────────────────────────────────────────────

/// Tracks how many callers are inside a section at once.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    async fn hold(&self, delay: Duration) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeSplitter {
    pages: usize,
    /// Documents whose page listing fails.
    unreadable: HashSet<String>,
    /// `(document, page)` whose split fails after the left half was written.
    fail_on: Option<(String, usize)>,
    split_calls: AtomicUsize,
}

impl FakeSplitter {
    fn with_pages(pages: usize) -> Self {
        Self {
            pages,
            ..Default::default()
        }
    }
}

fn stem(path: &Path) -> String {
    path.file_stem().unwrap().to_string_lossy().into_owned()
}

impl PageSplitter for FakeSplitter {
    async fn pages(&self, pdf: &Path) -> Result<Vec<PageInfo>, SplitError> {
        if self.unreadable.contains(&stem(pdf)) {
            return Err(SplitError::Load {
                path: pdf.to_path_buf(),
                detail: "not a PDF".into(),
            });
        }
        Ok((1..=self.pages)
            .map(|index| PageInfo {
                index,
                width: 1190.55,
                height: 841.89,
            })
            .collect())
    }

    async fn split_page(
        &self,
        pdf: &Path,
        page: PageInfo,
        targets: &SplitTargets,
    ) -> Result<(), SplitError> {
        self.split_calls.fetch_add(1, Ordering::SeqCst);
        for half in [&targets.left, &targets.right] {
            std::fs::create_dir_all(half.pdf.parent().unwrap()).unwrap();
            std::fs::write(&half.pdf, b"%PDF-1.7 half").unwrap();
            std::fs::write(&half.png, b"\x89PNG half").unwrap();
            if self.fail_on == Some((stem(pdf), page.index)) {
                return Err(SplitError::Render {
                    page: page.index,
                    detail: "bitmap allocation failed".into(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeOcr {
    /// Sides whose OCR exits with code 1.
    failing: HashSet<Side>,
    cannot_launch: bool,
    delay: Duration,
    calls: AtomicUsize,
    gauge: Gauge,
    devices: Mutex<Vec<String>>,
}

impl OcrEngine for FakeOcr {
    async fn run_ocr(&self, image: &Path, output_dir: &Path, device: &str) -> Result<String, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.devices.lock().unwrap().push(device.to_string());
        if self.cannot_launch {
            return Err(OcrError::Launch {
                program: "yomitoku".into(),
                detail: "No such file or directory (os error 2)".into(),
            });
        }
        assert!(image.is_file(), "OCR ran before split: {}", image.display());
        self.gauge.hold(self.delay).await;

        let name = stem(image);
        let side = if name.ends_with("_R") { Side::Right } else { Side::Left };
        if self.failing.contains(&side) {
            return Err(OcrError::Exit {
                code: Some(1),
                stderr: "RuntimeError: CUDA error".into(),
            });
        }
        std::fs::create_dir_all(output_dir).unwrap();
        let html = format!("<p>{name}</p>");
        std::fs::write(output_dir.join(format!("{name}_p1.html")), &html).unwrap();
        Ok(html)
    }
}

struct FakeModel {
    response: String,
    /// Transient failures returned before the first success.
    transient_failures: AtomicUsize,
    delay: Duration,
    calls: AtomicUsize,
    gauge: Gauge,
    seen: Mutex<Vec<(String, String)>>,
}

impl FakeModel {
    fn replying(response: &str) -> Self {
        Self {
            response: response.to_string(),
            transient_failures: AtomicUsize::new(0),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            gauge: Gauge::default(),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl ModelClient for FakeModel {
    async fn analyze(&self, request: &ModelRequest<'_>) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.pdf_path.is_file(), "model got a missing PDF");
        self.seen
            .lock()
            .unwrap()
            .push((request.html_text.to_string(), request.prompt_text.to_string()));
        self.gauge.hold(self.delay).await;

        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(ModelError::Request {
                status: Some(503),
                detail: "UNAVAILABLE".into(),
            });
        }
        Ok(self.response.clone())
    }
}

#[derive(Default)]
struct Events {
    completed: AtomicUsize,
    failed: Mutex<Vec<(HalfPageId, String)>>,
    skipped: AtomicUsize,
    document_errors: AtomicUsize,
}

impl PipelineProgressCallback for Events {
    fn on_half_page_complete(&self, _id: &HalfPageId, _json_path: &Path) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_half_page_error(&self, id: &HalfPageId, error: &str) {
        self.failed.lock().unwrap().push((id.clone(), error.to_string()));
    }

    fn on_half_page_skipped(&self, _id: &HalfPageId) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_document_error(&self, _document: &str, _error: &str) {
        self.document_errors.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

struct Workspace {
    _dir: tempfile::TempDir,
    input: PathBuf,
    output: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input_pdfs");
        let output = dir.path().join("outputs");
        std::fs::create_dir_all(&input).unwrap();
        Self {
            _dir: dir,
            input,
            output,
        }
    }

    fn pdf(&self, name: &str) -> Document {
        let path = self.input.join(name);
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        Document::from_path(path)
    }

    fn config(&self) -> spread2json::PipelineConfigBuilder {
        PipelineConfig::builder()
            .input_dir(&self.input)
            .output_dir(&self.output)
            .device("cpu")
            .retry_backoff_ms(1)
    }

    fn json(&self, document: &str, label: &str) -> PathBuf {
        self.output
            .join(document)
            .join(format!("{document}_{label}.json"))
    }
}

async fn run<S: PageSplitter, O: OcrEngine, M: ModelClient>(
    config: PipelineConfig,
    splitter: &S,
    ocr: &O,
    model: &M,
    documents: &[Document],
) -> Result<BatchReport, Spread2JsonError> {
    Pipeline::new(&config, "Return JSON.".into(), splitter, ocr, model)
        .run(documents)
        .await
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_page_spread_writes_both_halves() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let (splitter, ocr, model) = (FakeSplitter::with_pages(1), FakeOcr::default(), FakeModel::replying(ALICE));

    let report = run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed(), 2);
    for label in ["p01_l", "p01_r"] {
        let written = std::fs::read_to_string(ws.json("2024", label)).unwrap();
        assert_eq!(written, ALICE_2024, "{label}");
    }
    assert!(ws.output.join("2024/pdf_pages/2024_p01_L.pdf").is_file());
    assert!(ws.output.join("2024/pdf_pages/2024_p01_R.png").is_file());
    assert!(ws.output.join("2024/p01_l").is_dir());

    let seen = model.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().any(|(html, _)| html == "<p>2024_p01_L</p>"));
    assert!(seen.iter().all(|(_, prompt)| prompt == "Return JSON."));
    assert!(ocr.devices.lock().unwrap().iter().all(|d| d == "cpu"));
}

#[tokio::test]
async fn right_half_ocr_failure_leaves_left_intact() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let events = Arc::new(Events::default());
    let ocr = FakeOcr {
        failing: HashSet::from([Side::Right]),
        ..Default::default()
    };
    let (splitter, model) = (FakeSplitter::with_pages(1), FakeModel::replying(ALICE));
    let config = ws.config().progress_callback(events.clone()).build().unwrap();

    let report = run(config, &splitter, &ocr, &model, &[doc]).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.completed(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(
        std::fs::read_to_string(ws.json("2024", "p01_l")).unwrap(),
        ALICE_2024
    );
    assert!(!ws.json("2024", "p01_r").exists());
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);

    let right = &report.documents[0].half_pages[1];
    assert_eq!(right.id, HalfPageId::new("2024", 1, Side::Right));
    match &right.status {
        HalfPageStatus::Failed { reached, error } => {
            assert_eq!(*reached, HalfPageState::SplitDone);
            assert!(error.contains("code 1"), "got {error}");
            assert!(error.contains("CUDA error"), "got {error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(events.completed.load(Ordering::SeqCst), 1);
    let failed = events.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.side, Side::Right);
}

#[tokio::test]
async fn rerun_invokes_nothing_and_keeps_bytes() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let (splitter, ocr, model) = (FakeSplitter::with_pages(2), FakeOcr::default(), FakeModel::replying(ALICE));

    let first = run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc.clone()])
        .await
        .unwrap();
    assert_eq!(first.completed(), 4);
    let before = std::fs::read(ws.json("2024", "p02_r")).unwrap();

    let (splitter, ocr, model) = (FakeSplitter::with_pages(2), FakeOcr::default(), FakeModel::replying("{\"changed\": true}"));
    let events = Arc::new(Events::default());
    let config = ws.config().progress_callback(events.clone()).build().unwrap();
    let second = run(config, &splitter, &ocr, &model, &[doc]).await.unwrap();

    assert!(second.is_success());
    assert_eq!(second.skipped(), 4);
    assert_eq!(second.completed(), 0);
    assert_eq!(splitter.split_calls.load(Ordering::SeqCst), 0);
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(events.skipped.load(Ordering::SeqCst), 4);
    assert_eq!(std::fs::read(ws.json("2024", "p02_r")).unwrap(), before);
}

#[tokio::test]
async fn only_missing_halves_are_recomputed() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let (splitter, ocr, model) = (FakeSplitter::with_pages(2), FakeOcr::default(), FakeModel::replying(ALICE));
    run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc.clone()])
        .await
        .unwrap();
    std::fs::remove_file(ws.json("2024", "p02_l")).unwrap();

    let (splitter, ocr, model) = (FakeSplitter::with_pages(2), FakeOcr::default(), FakeModel::replying(ALICE));
    let report = run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc])
        .await
        .unwrap();

    assert_eq!(report.completed(), 1);
    assert_eq!(report.skipped(), 3);
    // page 1 is complete and is not split again
    assert_eq!(splitter.split_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    assert!(ws.json("2024", "p02_l").is_file());

    let ids: Vec<String> = report.documents[0]
        .half_pages
        .iter()
        .map(|o| o.id.label())
        .collect();
    assert_eq!(ids, vec!["p01_l", "p01_r", "p02_l", "p02_r"]);
}

#[tokio::test]
async fn force_recomputes_existing_output() {
    let ws = Workspace::new();
    let doc = ws.pdf("1987.pdf");
    let (splitter, ocr, model) = (FakeSplitter::with_pages(1), FakeOcr::default(), FakeModel::replying(ALICE));
    run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc.clone()])
        .await
        .unwrap();

    let (splitter, ocr, model) = (FakeSplitter::with_pages(1), FakeOcr::default(), FakeModel::replying("{\"data\": []}"));
    let report = run(ws.config().force(true).build().unwrap(), &splitter, &ocr, &model, &[doc])
        .await
        .unwrap();

    assert_eq!(report.completed(), 2);
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        std::fs::read_to_string(ws.json("1987", "p01_l")).unwrap(),
        "{\n  \"year\": \"1987\",\n  \"data\": []\n}\n"
    );
}

#[tokio::test]
async fn fenced_array_response_is_wrapped() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let model = FakeModel::replying("Sure! Here you go:\n```json\n[{\"name\":\"Alice\"}]\n```\n");
    let (splitter, ocr) = (FakeSplitter::with_pages(1), FakeOcr::default());

    run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc])
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(ws.json("2024", "p01_r")).unwrap(),
        ALICE_2024
    );
}

#[tokio::test]
async fn response_without_json_writes_nothing() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let model = FakeModel::replying("I cannot read this page.");
    let (splitter, ocr) = (FakeSplitter::with_pages(1), FakeOcr::default());

    let report = run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc])
        .await
        .unwrap();

    assert_eq!(report.failed(), 2);
    assert!(!ws.json("2024", "p01_l").exists());
    for outcome in &report.documents[0].half_pages {
        match &outcome.status {
            HalfPageStatus::Failed { reached, error } => {
                assert_eq!(*reached, HalfPageState::ModelDone);
                assert!(error.starts_with("No valid JSON"), "got {error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn transient_model_errors_are_retried() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let model = FakeModel::replying(ALICE);
    model.transient_failures.store(2, Ordering::SeqCst);
    let (splitter, ocr) = (FakeSplitter::with_pages(1), FakeOcr::default());

    let report = run(ws.config().build().unwrap(), &splitter, &ocr, &model, &[doc])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(model.calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.documents[0].half_pages[0].retries, 2);
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 2, "OCR is not retried");
}

#[tokio::test]
async fn model_failure_after_retries_is_recorded() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let model = FakeModel::replying(ALICE);
    model.transient_failures.store(100, Ordering::SeqCst);
    let (splitter, ocr) = (FakeSplitter::with_pages(1), FakeOcr::default());
    let config = ws.config().max_retries(1).build().unwrap();

    let report = run(config, &splitter, &ocr, &model, &[doc]).await.unwrap();

    assert_eq!(report.failed(), 2);
    let outcome = &report.documents[0].half_pages[0];
    assert_eq!(outcome.retries, 1);
    match &outcome.status {
        HalfPageStatus::Failed { reached, error } => {
            assert_eq!(*reached, HalfPageState::OcrDone);
            assert!(error.contains("HTTP 503"), "got {error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn split_failure_skips_document_and_removes_partial_output() {
    let ws = Workspace::new();
    let bad = ws.pdf("1999.pdf");
    let unreadable = ws.pdf("2001.pdf");
    let good = ws.pdf("2024.pdf");
    let events = Arc::new(Events::default());
    let splitter = FakeSplitter {
        pages: 2,
        unreadable: HashSet::from(["2001".to_string()]),
        fail_on: Some(("1999".to_string(), 2)),
        ..Default::default()
    };
    let (ocr, model) = (FakeOcr::default(), FakeModel::replying(ALICE));
    let config = ws.config().progress_callback(events.clone()).build().unwrap();

    let report = run(config, &splitter, &ocr, &model, &[bad, unreadable, good])
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed_documents(), 2);
    assert_eq!(events.document_errors.load(Ordering::SeqCst), 2);
    let bad_report = &report.documents[0];
    assert!(bad_report.split_error.as_deref().unwrap().contains("bitmap allocation failed"));
    // half-pages of the unsplittable document never ran
    assert_eq!(bad_report.half_pages.len(), 4);
    for outcome in &bad_report.half_pages {
        match &outcome.status {
            HalfPageStatus::Failed { reached, error } => {
                assert_eq!(*reached, HalfPageState::Pending);
                assert!(error.contains("bitmap allocation failed"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
    assert_eq!(bad_report.half_pages[0].id, HalfPageId::new("1999", 1, Side::Left));
    assert_eq!(report.failed(), 4);
    // a document that cannot even be listed has no half-pages
    assert!(report.documents[1].half_pages.is_empty());

    let pages_dir = ws.output.join("1999/pdf_pages");
    let leftovers: Vec<_> = std::fs::read_dir(&pages_dir)
        .map(|rd| rd.map(|e| e.unwrap().file_name()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "left behind: {leftovers:?}");

    // later documents are unaffected
    assert_eq!(report.documents[2].half_pages.len(), 4);
    assert!(report.documents[2].is_success());
    assert!(ws.json("2024", "p02_r").is_file());
    // no OCR ran for the failed documents
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn ocr_launch_failure_aborts_batch() {
    let ws = Workspace::new();
    let docs = [ws.pdf("2023.pdf"), ws.pdf("2024.pdf")];
    let ocr = FakeOcr {
        cannot_launch: true,
        ..Default::default()
    };
    let (splitter, model) = (FakeSplitter::with_pages(1), FakeModel::replying(ALICE));

    let err = run(ws.config().build().unwrap(), &splitter, &ocr, &model, &docs)
        .await
        .unwrap_err();

    assert!(matches!(err, Spread2JsonError::OcrLaunch { .. }), "got {err:?}");
    assert!(err.to_string().contains("yomitoku"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_half_pages_share_one_ocr_device() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let ocr = FakeOcr {
        delay: Duration::from_millis(20),
        ..Default::default()
    };
    let mut model = FakeModel::replying(ALICE);
    model.delay = Duration::from_millis(150);
    let splitter = FakeSplitter::with_pages(3);

    let report = run(ws.config().concurrency(4).build().unwrap(), &splitter, &ocr, &model, &[doc])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed(), 6);
    assert_eq!(ocr.gauge.peak(), 1, "OCR overlapped on one device");
    assert!(model.gauge.peak() >= 2, "model calls did not overlap");

    let labels: Vec<String> = report.documents[0]
        .half_pages
        .iter()
        .map(|o| o.id.label())
        .collect();
    assert_eq!(labels, vec!["p01_l", "p01_r", "p02_l", "p02_r", "p03_l", "p03_r"]);
}

#[tokio::test]
async fn sequential_default_never_overlaps() {
    let ws = Workspace::new();
    let doc = ws.pdf("2024.pdf");
    let mut model = FakeModel::replying(ALICE);
    model.delay = Duration::from_millis(5);
    let (splitter, ocr) = (FakeSplitter::with_pages(2), FakeOcr::default());

    let config = ws.config().build().unwrap();
    assert_eq!(config.concurrency, 1);
    run(config, &splitter, &ocr, &model, &[doc]).await.unwrap();

    assert_eq!(model.gauge.peak(), 1);
}
