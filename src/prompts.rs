//! Instruction prompt loading and OCR context framing.
//!
//! The extraction schema lives in an operator-owned prompt file
//! (`prompt_file_path`); this crate never ships a default schema. What it
//! does own is how the OCR HTML is framed as context next to that prompt,
//! so the model can tell the instruction from the recognised text.

use crate::error::Spread2JsonError;
use std::path::Path;

/// Header placed before the OCR HTML in the model request.
pub const OCR_CONTEXT_HEADER: &str = "OCR result for the attached half-page PDF (HTML, produced by the OCR engine). \
Use it as a transcription aid; the PDF is authoritative where they disagree.";

/// Wrap OCR HTML as a context block for the model request.
pub fn ocr_context(html: &str) -> String {
    format!("{OCR_CONTEXT_HEADER}\n\n<ocr_html>\n{}\n</ocr_html>", html.trim())
}

/// Read the instruction prompt, rejecting an empty file.
pub async fn load_prompt(path: &Path) -> Result<String, Spread2JsonError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Spread2JsonError::PromptRead {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    if text.trim().is_empty() {
        return Err(Spread2JsonError::PromptRead {
            path: path.to_path_buf(),
            detail: "prompt file is empty".into(),
        });
    }
    Ok(text)
}
