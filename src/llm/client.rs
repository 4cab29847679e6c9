use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

use crate::config::DEFAULT_ANALYSIS_MODEL;
use crate::error::{AdvisorError, Result};
use crate::generation::{GenerationRequest, GenerativeModel, ToolGrant};
use crate::ingestion::Document;
use crate::llm::types::*;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta/files";
const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
const UPLOAD_MAX_POLLS: usize = 90;

const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
    "IMAGE_SAFETY",
];

/// [`GenerativeModel`] backed by the Gemini REST API.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    upload_url: String,
    default_model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            upload_url: GEMINI_UPLOAD_URL.to_string(),
            default_model: DEFAULT_ANALYSIS_MODEL.to_string(),
        }
    }

    /// Reads the API key from `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AdvisorError::Validation("GEMINI_API_KEY must be set".to_string()))?;
        Ok(Self::new(api_key))
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Points the client at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Uploads a file through the resumable File API and waits until Gemini
    /// has finished processing it. The returned document references the file
    /// by URI instead of carrying its bytes.
    pub async fn upload_document(&self, path: &Path) -> Result<Document> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AdvisorError::Validation(format!("Invalid file name: {:?}", path)))?;

        let file_size = fs::metadata(path).await?.len();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        let file_bytes = fs::read(path).await?;

        let metadata = json!({ "file": { "display_name": file_name } });

        let init_res = self
            .client
            .post(&self.upload_url)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", file_size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", &mime_type)
            .header("Content-Type", "application/json")
            .json(&metadata)
            .send()
            .await?;

        let init_status = init_res.status();
        if !init_status.is_success() {
            let error_text = init_res.text().await?;
            return Err(classify_http_error(init_status.as_u16(), &error_text));
        }

        let upload_url = init_res
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AdvisorError::RemoteUnavailable("Upload session returned no upload URL".to_string())
            })?
            .to_string();

        let upload_res = self
            .client
            .post(&upload_url)
            .header("Content-Length", file_size.to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(file_bytes)
            .send()
            .await?;

        let upload_status = upload_res.status();
        if !upload_status.is_success() {
            let error_text = upload_res.text().await?;
            return Err(classify_http_error(upload_status.as_u16(), &error_text));
        }

        let body: serde_json::Value = upload_res.json().await?;
        let mut file: RemoteFile = serde_json::from_value(body.get("file").cloned().ok_or_else(
            || AdvisorError::RemoteUnavailable("Upload response missing 'file'".to_string()),
        )?)?;

        let mut polls = 0;
        while !file.is_active() {
            if file.has_failed() {
                return Err(AdvisorError::RemoteRejected(format!(
                    "Gemini failed to process '{}'",
                    file_name
                )));
            }
            if polls >= UPLOAD_MAX_POLLS {
                return Err(AdvisorError::RemoteUnavailable(format!(
                    "'{}' was still processing after {} checks",
                    file_name, polls
                )));
            }
            polls += 1;
            sleep(UPLOAD_POLL_INTERVAL).await;

            let check_url = format!("{}/{}", self.base_url, file.name);
            let check_res = self
                .client
                .get(&check_url)
                .header("x-goog-api-key", &self.api_key)
                .send()
                .await?;
            let status = check_res.status();
            if !status.is_success() {
                let error_text = check_res.text().await?;
                return Err(classify_http_error(status.as_u16(), &error_text));
            }
            let check_json: serde_json::Value = check_res.json().await?;
            let file_obj = check_json.get("file").unwrap_or(&check_json).clone();
            file = serde_json::from_value(file_obj)?;
        }

        debug!("Uploaded '{}' as {}", file_name, file.uri);
        Ok(Document::from_uri(
            file_name,
            file.mime_type.unwrap_or(mime_type),
            file.uri,
        ))
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let payload = build_payload(request)?;

        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await?;
            warn!("Gemini API error (model {}, status {})", model, status);
            return Err(classify_http_error(status.as_u16(), &err_text));
        }

        let body: GenerateContentResponse = res.json().await?;
        extract_reply(body)
    }
}

/// Maps a request onto the Gemini wire format.
///
/// Gemini rejects a JSON response MIME type combined with search tools, so a
/// schema on a tool-enabled request is moved into the system instruction and
/// the reply is parsed from text.
pub(crate) fn build_payload(request: &GenerationRequest) -> Result<GenerateContentRequest> {
    let tools: Vec<Tool> = request
        .tools
        .iter()
        .map(|grant| match grant {
            ToolGrant::WebSearch => Tool {
                google_search: Some(GoogleSearch {}),
            },
        })
        .collect();

    let mut system_text = request.system_instruction.clone();
    let mut generation_config = GenerationConfig::default();

    if let Some(schema) = &request.response_schema {
        if tools.is_empty() {
            generation_config.response_mime_type = Some("application/json".to_string());
            generation_config.response_schema = Some(schema.clone());
        } else {
            let schema_text = format!(
                "Respond ONLY with a single JSON object (no markdown, no commentary) that conforms to this JSON schema:\n{}",
                serde_json::to_string_pretty(schema)?
            );
            system_text = Some(match system_text {
                Some(existing) => format!("{}\n\n{}", existing, schema_text),
                None => schema_text,
            });
        }
    }

    Ok(GenerateContentRequest {
        contents: request.messages.iter().map(Content::from).collect(),
        system_instruction: system_text.map(Content::system),
        tools,
        generation_config,
    })
}

/// Joins the answer text of the first candidate, skipping thought parts.
pub(crate) fn extract_reply(body: GenerateContentResponse) -> Result<String> {
    if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(AdvisorError::RemoteRejected(format!(
            "Prompt blocked by Gemini: {}",
            reason
        )));
    }

    let candidate = body
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| {
            AdvisorError::MalformedModelOutput("Gemini returned no candidates".to_string())
        })?;

    if let Some(reason) = candidate.finish_reason.as_deref() {
        if BLOCKING_FINISH_REASONS.contains(&reason) {
            return Err(AdvisorError::RemoteRejected(format!(
                "Response withheld by Gemini: {}",
                reason
            )));
        }
    }

    let text: String = candidate
        .content
        .map(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter(|p| p.thought != Some(true))
        .filter_map(|p| p.text)
        .collect();

    if text.trim().is_empty() {
        return Err(AdvisorError::MalformedModelOutput(
            "Gemini candidate contained no text".to_string(),
        ));
    }
    Ok(text)
}

/// Auth, quota, bad-request and policy failures are rejections; timeouts and
/// server errors are transient.
pub(crate) fn classify_http_error(status: u16, body: &str) -> AdvisorError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| match b.error.status {
            Some(s) => format!("{}: {}", s, b.error.message),
            None => b.error.message,
        })
        .unwrap_or_else(|_| body.trim().to_string());

    match status {
        408 | 500..=599 => AdvisorError::RemoteUnavailable(format!("HTTP {}: {}", status, message)),
        401 | 403 => AdvisorError::RemoteRejected(format!("authentication failed: {}", message)),
        429 => AdvisorError::RemoteRejected(format!("quota exceeded: {}", message)),
        _ => AdvisorError::RemoteRejected(format!("HTTP {}: {}", status, message)),
    }
}
