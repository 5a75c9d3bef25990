//! CLI binary for spread2json.
//!
//! A thin shim over the library crate: load the TOML config, apply flag
//! overrides, run the batch and map the report to an exit status.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use spread2json::{
    run_batch, BatchReport, FileConfig, HalfPageId, HalfPageStatus, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, DEFAULT_CONFIG_FILE,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────

/// Live progress bar plus one status line per finished half-page. The bar
/// length grows as each document reports its pending half-pages.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<HalfPageId, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} half-pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed(&self, id: &HalfPageId) -> String {
        let secs = self
            .start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        dim(&format!("{secs:.1}s"))
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_documents: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{total_documents} document(s) to process"))
        ));
    }

    fn on_document_start(&self, document: &str, pages: usize, pending_half_pages: usize) {
        self.bar.inc_length(pending_half_pages as u64);
        self.bar.set_message(document.to_string());
        let skipped = (pages * 2).saturating_sub(pending_half_pages);
        self.bar.println(format!(
            "{} {}  {} pages, {} pending{}",
            cyan("◆"),
            bold(document),
            pages,
            pending_half_pages,
            if skipped > 0 {
                dim(&format!(", {skipped} already done"))
            } else {
                String::new()
            }
        ));
    }

    fn on_document_error(&self, document: &str, error: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            red("✗"),
            bold(document),
            red(error)
        ));
    }

    fn on_half_page_start(&self, id: &HalfPageId) {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Instant::now());
    }

    fn on_half_page_complete(&self, id: &HalfPageId, json_path: &Path) {
        self.bar.println(format!(
            "  {} {:<16} {}  {}",
            green("✓"),
            id.to_string(),
            dim(&json_path.display().to_string()),
            self.elapsed(id)
        ));
        self.bar.inc(1);
    }

    fn on_half_page_error(&self, id: &HalfPageId, error: &str) {
        // full message, never truncated
        self.bar.println(format!(
            "  {} {:<16} {}  {}",
            red("✗"),
            id.to_string(),
            red(error),
            self.elapsed(id)
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _report: &BatchReport) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process every PDF in ./input_pdfs using ./spread2json.toml
  spread2json

  # One PDF, CPU OCR
  spread2json --pdf scans/2024.pdf --device cpu

  # Recompute everything, two half-pages in flight
  spread2json --force --concurrency 2

  # Machine-readable report
  spread2json --json > report.json

CONFIG FILE (spread2json.toml):
  input_dir           = "input_pdfs"
  output_dir          = "outputs"
  ocr_executable_path = "yomitoku"
  device              = "cuda"
  model_id            = "models/gemini-2.5-flash"
  prompt_file_path    = "prompt.md"
  api_key             = "..."        # only ever read from this file

OUTPUT LAYOUT:
  outputs/<D>/pdf_pages/<D>_pNN_L.pdf|png   split halves
  outputs/<D>/pNN_l/                        OCR HTML
  outputs/<D>/<D>_pNN_l.json                extracted records

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH     Path to libpdfium (file or directory)
  RUST_LOG            Log filter, overrides --verbose/--quiet
"#;

/// Split double-page PDF spreads, OCR each half and extract JSON with a multimodal LLM.
#[derive(Parser, Debug)]
#[command(
    name = "spread2json",
    version,
    about = "Split double-page PDF spreads, OCR each half and extract JSON with a multimodal LLM",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// TOML config file (default: ./spread2json.toml if present).
    #[arg(long, env = "SPREAD2JSON_CONFIG")]
    config: Option<PathBuf>,

    /// Process this single PDF instead of scanning a directory.
    #[arg(long, env = "SPREAD2JSON_PDF")]
    pdf: Option<PathBuf>,

    /// Directory scanned for *.pdf files.
    #[arg(long, env = "SPREAD2JSON_PDF_DIR")]
    pdf_dir: Option<PathBuf>,

    /// Instruction prompt file sent with every half-page.
    #[arg(long, env = "SPREAD2JSON_PROMPT")]
    prompt: Option<PathBuf>,

    /// Output root directory.
    #[arg(short, long, env = "SPREAD2JSON_OUTPUT")]
    output: Option<PathBuf>,

    /// OCR device selector (cpu, cuda, ...).
    #[arg(long, env = "SPREAD2JSON_DEVICE")]
    device: Option<String>,

    /// Model id (e.g. models/gemini-2.5-flash).
    #[arg(long, env = "SPREAD2JSON_MODEL")]
    model: Option<String>,

    /// OCR executable.
    #[arg(long, env = "SPREAD2JSON_OCR")]
    ocr: Option<PathBuf>,

    /// Half-pages processed concurrently within a document.
    #[arg(short, long, env = "SPREAD2JSON_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Rasterisation DPI for the OCR images (72–600).
    #[arg(long, env = "SPREAD2JSON_DPI",
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: Option<u32>,

    /// Recompute half-pages whose JSON already exists.
    #[arg(long, env = "SPREAD2JSON_FORCE")]
    force: bool,

    /// Print the batch report as JSON on stdout.
    #[arg(long, env = "SPREAD2JSON_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SPREAD2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SPREAD2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SPREAD2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;
    tracing::debug!("{config:?}");

    // ── Run ──────────────────────────────────────────────────────────────
    let report = run_batch(&config).await.context("Batch aborted")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&report, show_progress);
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Config file first, then flag overrides.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::load_optional(Path::new(DEFAULT_CONFIG_FILE))?,
    };

    let mut builder = PipelineConfig::builder().file_config(file);
    if let Some(ref p) = cli.pdf {
        builder = builder.single_pdf(p);
    }
    if let Some(ref d) = cli.pdf_dir {
        builder = builder.input_dir(d);
    }
    if let Some(ref p) = cli.prompt {
        builder = builder.prompt_path(p);
    }
    if let Some(ref o) = cli.output {
        builder = builder.output_dir(o);
    }
    if let Some(ref d) = cli.device {
        builder = builder.device(d);
    }
    if let Some(ref m) = cli.model {
        builder = builder.model_id(m);
    }
    if let Some(ref o) = cli.ocr {
        builder = builder.ocr_executable(o);
    }
    if let Some(n) = cli.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(dpi) = cli.dpi {
        builder = builder.dpi(dpi);
    }
    if cli.force {
        builder = builder.force(true);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(report: &BatchReport, progress_shown: bool) {
    // Without the bar nothing has listed the failures yet.
    if !progress_shown {
        for doc in &report.documents {
            if let Some(ref e) = doc.split_error {
                eprintln!("  {} {}  {}", red("✗"), bold(&doc.id), red(e));
            }
            for outcome in &doc.half_pages {
                if let HalfPageStatus::Failed { ref error, .. } = outcome.status {
                    eprintln!("  {} {:<16} {}", red("✗"), outcome.id.to_string(), red(error));
                }
            }
        }
    }

    let failed = report.failed();
    let bad_docs = report.failed_documents();
    eprintln!(
        "{}  {} written, {} skipped, {} failed{}  {}",
        if report.is_success() { green("✔") } else { red("✘") },
        bold(&report.completed().to_string()),
        report.skipped(),
        if failed == 0 {
            "0".to_string()
        } else {
            red(&failed.to_string())
        },
        if bad_docs == 0 {
            String::new()
        } else {
            red(&format!(", {bad_docs} document(s) unsplittable"))
        },
        dim(&format!("{}ms", report.total_duration_ms)),
    );
}
