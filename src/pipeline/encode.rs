//! Attachment encoding: half-page PDF → base64 inline data.
//!
//! Gemini accepts documents as `inlineData` parts embedded in the JSON
//! request body. The half-page PDF is sent as-is rather than re-rendered,
//! so the model sees the original vector text and full-resolution scans.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;
use tracing::debug;

/// MIME type of every attachment this pipeline sends.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// Base64-encoded file plus its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// Encode raw PDF bytes for inline attachment.
pub fn encode_pdf_bytes(bytes: &[u8]) -> InlineData {
    let data = STANDARD.encode(bytes);
    debug!("Encoded PDF {} bytes → {} bytes base64", bytes.len(), data.len());
    InlineData {
        mime_type: PDF_MIME_TYPE.to_string(),
        data,
    }
}

/// Read and encode a half-page PDF.
pub async fn encode_pdf(path: &Path) -> std::io::Result<InlineData> {
    let bytes = tokio::fs::read(path).await?;
    Ok(encode_pdf_bytes(&bytes))
}
