//! OCR stage: run the external engine on a half-page PNG and read its HTML.
//!
//! The engine is an opaque subprocess invoked as
//! `<ocr> <image> -f html -o <dir> -d <device>`. Its output file name is not
//! part of the contract, so finding the HTML it produced is delegated to an
//! [`OutputLocator`]; [`ScanLocator`] scans the output directory. HTML left
//! there by an earlier run is removed before the engine starts, so a run that
//! writes nothing surfaces as [`OcrError::MissingOutput`].
//!
//! Nothing here retries. A missing or non-executable engine is reported as
//! [`OcrError::Launch`], which the orchestrator treats as fatal for the batch.

use crate::error::OcrError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::debug;

/// Lines of stderr kept in an [`OcrError::Exit`].
const STDERR_TAIL_LINES: usize = 20;

/// Produces OCR HTML for one half-page image.
pub trait OcrEngine: Send + Sync {
    fn run_ocr(
        &self,
        image: &Path,
        output_dir: &Path,
        device: &str,
    ) -> impl Future<Output = Result<String, OcrError>> + Send;
}

impl<T: OcrEngine> OcrEngine for &T {
    fn run_ocr(
        &self,
        image: &Path,
        output_dir: &Path,
        device: &str,
    ) -> impl Future<Output = Result<String, OcrError>> + Send {
        (**self).run_ocr(image, output_dir, device)
    }
}

/// Finds the HTML file an engine wrote for `image` inside `output_dir`.
pub trait OutputLocator: Send + Sync {
    fn locate_output(&self, image: &Path, output_dir: &Path) -> Option<PathBuf>;
}

/// Directory scan: prefer `*.html` files whose name contains the image
/// stem, newest first; otherwise the newest `*.html` of any name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanLocator;

impl OutputLocator for ScanLocator {
    fn locate_output(&self, image: &Path, output_dir: &Path) -> Option<PathBuf> {
        let stem = image.file_stem()?.to_string_lossy().into_owned();
        let mut candidates: Vec<(bool, SystemTime, PathBuf)> = std::fs::read_dir(output_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_html(p))
            .map(|p| {
                let named = p
                    .file_name()
                    .map(|n| n.to_string_lossy().contains(stem.as_str()))
                    .unwrap_or(false);
                let mtime = p
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (named, mtime, p)
            })
            .collect();

        // stem match first, then newest, then path for a stable tie-break
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
        candidates.into_iter().next().map(|(_, _, p)| p)
    }
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("html"))
        .unwrap_or(false)
}

/// [`OcrEngine`] that runs an executable such as `yomitoku`.
#[derive(Debug, Clone)]
pub struct CommandOcr<L = ScanLocator> {
    program: PathBuf,
    timeout: Option<Duration>,
    locator: L,
}

impl CommandOcr<ScanLocator> {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
            locator: ScanLocator,
        }
    }
}

impl<L: OutputLocator> CommandOcr<L> {
    /// Kill the engine and fail the half-page if it runs longer than this.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_locator<M: OutputLocator>(self, locator: M) -> CommandOcr<M> {
        CommandOcr {
            program: self.program,
            timeout: self.timeout,
            locator,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, image: &Path, output_dir: &Path, device: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(image)
            .args(["-f", "html", "-o"])
            .arg(output_dir)
            .args(["-d", device])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl<L: OutputLocator> OcrEngine for CommandOcr<L> {
    async fn run_ocr(&self, image: &Path, output_dir: &Path, device: &str) -> Result<String, OcrError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| OcrError::OutputDir {
                path: output_dir.to_path_buf(),
                detail: e.to_string(),
            })?;
        clear_html(output_dir)
            .await
            .map_err(|e| OcrError::OutputDir {
                path: output_dir.to_path_buf(),
                detail: format!("cannot remove stale HTML: {e}"),
            })?;

        debug!(
            program = %self.program.display(),
            image = %image.display(),
            device,
            "Running OCR"
        );
        let run = self.command(image, output_dir, device).output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| OcrError::Timeout {
                    secs: limit.as_secs(),
                })?,
            None => run.await,
        }
        .map_err(|e| OcrError::Launch {
            program: self.program.clone(),
            detail: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(OcrError::Exit {
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let html_path = self
            .locator
            .locate_output(image, output_dir)
            .ok_or_else(|| OcrError::MissingOutput {
                dir: output_dir.to_path_buf(),
            })?;
        debug!("OCR output: {}", html_path.display());

        tokio::fs::read_to_string(&html_path)
            .await
            .map_err(|e| OcrError::ReadOutput {
                path: html_path,
                detail: e.to_string(),
            })
    }
}

/// Remove `*.html` left in `dir` by an earlier run, so only this run's
/// output can be located.
async fn clear_html(dir: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_html(&path) && entry.file_type().await?.is_file() {
            debug!("Removing stale OCR output {}", path.display());
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

/// Last [`STDERR_TAIL_LINES`] non-empty lines of stderr.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
