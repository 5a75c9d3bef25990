//! Configuration for a spread-to-JSON batch run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. The CLI fills the builder from a TOML file
//! ([`FileConfig`]) and then applies flag overrides on top.
//!
//! The model API key is accepted only from the configuration file; no
//! environment variable is consulted for it, so it never leaks into shared
//! shells or child-process environments.

use crate::error::Spread2JsonError;
use crate::progress::ProgressCallback;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "spread2json.toml";

/// Smallest accepted longest-edge render cap.
pub const MIN_RENDERED_PIXELS: u32 = 100;

/// Default Gemini REST base URL.
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration for one batch run.
///
/// # Example
/// ```rust
/// use spread2json::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .input_dir("scans")
///     .device("cpu")
///     .concurrency(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.device, "cpu");
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory scanned for `*.pdf` inputs. Ignored when `single_pdf` is set.
    pub input_dir: Option<PathBuf>,

    /// Process exactly this PDF instead of scanning `input_dir`.
    pub single_pdf: Option<PathBuf>,

    /// Root of the output tree. Default: `outputs`.
    pub output_dir: PathBuf,

    /// OCR executable (Yomitoku-compatible CLI). Default: `yomitoku`.
    pub ocr_executable: PathBuf,

    /// Device selector passed to the OCR engine (`cpu`, `cuda`, ...). Default: `cuda`.
    ///
    /// The device identifier is also the key of the OCR mutual-exclusion lock.
    pub device: String,

    /// Model identifier. Default: `models/gemini-2.5-flash`.
    pub model_id: String,

    /// Instruction prompt file. Default: `prompt.md`.
    pub prompt_path: PathBuf,

    /// Model API key. Read from the config file only.
    pub api_key: Option<String>,

    /// Base URL of the model REST API.
    pub api_base: String,

    /// Raster DPI of the half-page PNGs fed to OCR. Range: 72–600. Default: 300.
    ///
    /// Yearbook scans carry small print; 300 DPI keeps furigana and table
    /// footnotes legible to the OCR engine.
    pub dpi: u32,

    /// Longest-edge pixel cap for the full-page render. Default: 8000.
    pub max_rendered_pixels: u32,

    /// Half-pages processed concurrently within a document. Default: 1.
    ///
    /// OCR stays serialised per device regardless of this value; only the
    /// model and postprocessing stages overlap.
    pub concurrency: usize,

    /// Retries of a retryable model failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-request model timeout in seconds. Default: 600.
    pub api_timeout_secs: u64,

    /// OCR subprocess timeout in seconds. Default: none (wait indefinitely).
    pub ocr_timeout_secs: Option<u64>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Upper bound on generated tokens. Default: provider default.
    pub max_output_tokens: Option<u32>,

    /// Explicit libpdfium path; falls back to `PDFIUM_LIB_PATH`, the
    /// executable's directory, then the system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Reprocess half-pages whose JSON already exists. Default: false.
    pub force: bool,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: Some(PathBuf::from("input_pdfs")),
            single_pdf: None,
            output_dir: PathBuf::from("outputs"),
            ocr_executable: PathBuf::from("yomitoku"),
            device: "cuda".to_string(),
            model_id: "models/gemini-2.5-flash".to_string(),
            prompt_path: PathBuf::from("prompt.md"),
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            dpi: 300,
            max_rendered_pixels: 8000,
            concurrency: 1,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 600,
            ocr_timeout_secs: None,
            temperature: 0.1,
            max_output_tokens: None,
            pdfium_lib_path: None,
            force: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("input_dir", &self.input_dir)
            .field("single_pdf", &self.single_pdf)
            .field("output_dir", &self.output_dir)
            .field("ocr_executable", &self.ocr_executable)
            .field("device", &self.device)
            .field("model_id", &self.model_id)
            .field("prompt_path", &self.prompt_path)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("dpi", &self.dpi)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("ocr_timeout_secs", &self.ocr_timeout_secs)
            .field("force", &self.force)
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Seed every field present in `file`; absent keys keep their defaults.
    pub fn file_config(mut self, file: FileConfig) -> Self {
        let c = &mut self.config;
        if let Some(v) = file.input_dir {
            c.input_dir = Some(v);
        }
        if let Some(v) = file.single_pdf {
            c.single_pdf = Some(v);
        }
        if let Some(v) = file.output_dir {
            c.output_dir = v;
        }
        if let Some(v) = file.ocr_executable_path {
            c.ocr_executable = v;
        }
        if let Some(v) = file.device {
            c.device = v;
        }
        if let Some(v) = file.model_id {
            c.model_id = v;
        }
        if let Some(v) = file.prompt_file_path {
            c.prompt_path = v;
        }
        if let Some(v) = file.api_key.filter(|k| !k.trim().is_empty()) {
            c.api_key = Some(v);
        }
        if let Some(v) = file.api_base {
            c.api_base = v;
        }
        if let Some(v) = file.dpi {
            c.dpi = v;
        }
        if let Some(v) = file.max_rendered_pixels {
            c.max_rendered_pixels = v;
        }
        if let Some(v) = file.concurrency {
            c.concurrency = v;
        }
        if let Some(v) = file.max_retries {
            c.max_retries = v;
        }
        if let Some(v) = file.retry_backoff_ms {
            c.retry_backoff_ms = v;
        }
        if let Some(v) = file.api_timeout_secs {
            c.api_timeout_secs = v;
        }
        if file.ocr_timeout_secs.is_some() {
            c.ocr_timeout_secs = file.ocr_timeout_secs;
        }
        if let Some(v) = file.temperature {
            c.temperature = v;
        }
        if file.max_output_tokens.is_some() {
            c.max_output_tokens = file.max_output_tokens;
        }
        if file.pdfium_lib_path.is_some() {
            c.pdfium_lib_path = file.pdfium_lib_path;
        }
        if let Some(v) = file.force {
            c.force = v;
        }
        self
    }

    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = Some(dir.into());
        self
    }

    pub fn single_pdf(mut self, pdf: impl Into<PathBuf>) -> Self {
        self.config.single_pdf = Some(pdf.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn ocr_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ocr_executable = path.into();
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = device.into();
        self
    }

    pub fn model_id(mut self, model: impl Into<String>) -> Self {
        self.config.model_id = model.into();
        self
    }

    pub fn prompt_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.prompt_path = path.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = base.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = Some(secs);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: u32) -> Self {
        self.config.max_output_tokens = Some(n);
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn force(mut self, v: bool) -> Self {
        self.config.force = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Spread2JsonError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(Spread2JsonError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.max_rendered_pixels < MIN_RENDERED_PIXELS {
            return Err(Spread2JsonError::InvalidConfig(format!(
                "max_rendered_pixels must be ≥ {MIN_RENDERED_PIXELS}, got {}",
                c.max_rendered_pixels
            )));
        }
        if c.concurrency == 0 {
            return Err(Spread2JsonError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.device.trim().is_empty() {
            return Err(Spread2JsonError::InvalidConfig(
                "Device must not be empty".into(),
            ));
        }
        if c.model_id.trim().is_empty() {
            return Err(Spread2JsonError::InvalidConfig(
                "Model id must not be empty".into(),
            ));
        }
        if c.single_pdf.is_none() && c.input_dir.is_none() {
            return Err(Spread2JsonError::NoInput);
        }
        Ok(self.config)
    }
}

/// On-disk configuration file (TOML). Every key is optional.
///
/// ```toml
/// input_dir = "input_pdfs"
/// output_dir = "outputs"
/// ocr_executable_path = ".venv/bin/yomitoku"
/// device = "cuda"
/// model_id = "models/gemini-2.5-flash"
/// prompt_file_path = "prompt.md"
/// api_key = "..."
/// ```
#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub input_dir: Option<PathBuf>,
    pub single_pdf: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub ocr_executable_path: Option<PathBuf>,
    pub device: Option<String>,
    pub model_id: Option<String>,
    pub prompt_file_path: Option<PathBuf>,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub dpi: Option<u32>,
    pub max_rendered_pixels: Option<u32>,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub api_timeout_secs: Option<u64>,
    pub ocr_timeout_secs: Option<u64>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub pdfium_lib_path: Option<PathBuf>,
    pub force: Option<bool>,
}

impl fmt::Debug for FileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileConfig")
            .field("input_dir", &self.input_dir)
            .field("single_pdf", &self.single_pdf)
            .field("output_dir", &self.output_dir)
            .field("device", &self.device)
            .field("model_id", &self.model_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl FileConfig {
    /// Parse TOML text. Relative paths are resolved against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, String> {
        let mut file: FileConfig = toml::from_str(text).map_err(|e| e.to_string())?;
        file.resolve_relative(base_dir);
        Ok(file)
    }

    /// Load a config file from disk.
    pub fn load(path: &Path) -> Result<Self, Spread2JsonError> {
        let text = std::fs::read_to_string(path).map_err(|e| Spread2JsonError::ConfigRead {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base).map_err(|detail| Spread2JsonError::ConfigRead {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Load `path` if it exists, otherwise return an empty config.
    pub fn load_optional(path: &Path) -> Result<Self, Spread2JsonError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn resolve_relative(&mut self, base: &Path) {
        let fields = [
            &mut self.input_dir,
            &mut self.single_pdf,
            &mut self.output_dir,
            &mut self.prompt_file_path,
            &mut self.pdfium_lib_path,
        ];
        for field in fields {
            if let Some(p) = field.as_mut() {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }
        // A bare command name is looked up on PATH; only anchor real paths.
        if let Some(p) = self.ocr_executable_path.as_mut() {
            if p.is_relative() && p.components().count() > 1 {
                *p = base.join(&*p);
            }
        }
    }
}
