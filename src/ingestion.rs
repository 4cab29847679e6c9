use crate::error::{AdvisorError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// A MIME-typed document attached to an analysis request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub display_name: String,
    pub mime_type: String,
    pub source: DocumentSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DocumentSource {
    /// Raw bytes sent inline with the request (base64 on the wire).
    Inline {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// A file already hosted by the model provider (e.g. a Gemini File API URI).
    Uri { uri: String },
}

impl Document {
    pub fn from_bytes(
        display_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            mime_type: mime_type.into(),
            source: DocumentSource::Inline { data },
        }
    }

    pub fn from_uri(
        display_name: impl Into<String>,
        mime_type: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            mime_type: mime_type.into(),
            source: DocumentSource::Uri { uri: uri.into() },
        }
    }

    /// Parses a `data:<mimetype>;base64,<payload>` URI, the format browsers
    /// produce for uploaded files.
    pub fn from_data_uri(display_name: impl Into<String>, data_uri: &str) -> Result<Self> {
        let rest = data_uri.trim().strip_prefix("data:").ok_or_else(|| {
            AdvisorError::Validation("Data URI must start with 'data:'".to_string())
        })?;

        let (header, payload) = rest.split_once(',').ok_or_else(|| {
            AdvisorError::Validation("Data URI is missing the ',' separator".to_string())
        })?;

        let mime_type = header.strip_suffix(";base64").ok_or_else(|| {
            AdvisorError::Validation("Only base64-encoded data URIs are supported".to_string())
        })?;

        if mime_type.is_empty() {
            return Err(AdvisorError::Validation(
                "Data URI does not declare a MIME type".to_string(),
            ));
        }

        let data = STANDARD
            .decode(payload.trim())
            .map_err(|e| AdvisorError::Validation(format!("Invalid base64 payload: {}", e)))?;

        Ok(Self::from_bytes(display_name, mime_type, data))
    }

    pub fn size_bytes(&self) -> Option<usize> {
        match &self.source {
            DocumentSource::Inline { data } => Some(data.len()),
            DocumentSource::Uri { .. } => None,
        }
    }
}

/// Reads a file from disk, guessing its MIME type from the extension.
pub async fn load_document(path: &Path) -> Result<Document> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AdvisorError::Validation(format!("Invalid file name: {:?}", path)))?;

    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    let data = fs::read(path).await?;

    log::debug!(
        "Loaded document '{}' ({}, {} bytes)",
        file_name,
        mime_type,
        data.len()
    );

    Ok(Document::from_bytes(file_name, mime_type, data))
}

/// Loads several files concurrently, preserving input order.
pub async fn load_documents<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Document>> {
    future::try_join_all(paths.iter().map(|p| load_document(p.as_ref()))).await
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
