//! Generation client: the boundary between the orchestrators and a remote
//! generative model.
//!
//! [`GenerativeModel`] is the transport seam (one request in, raw reply text
//! out). [`GenerationClient`] layers the contract on top of it: a call timeout,
//! schema-constrained structured output, and a bounded retry budget reserved
//! for [`AdvisorError::MalformedModelOutput`].

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AdvisorConfig;
use crate::error::{AdvisorError, Result};
use crate::ingestion::Document;
use crate::schema::{gemini_response_schema, ChatRole, ChatTurn, StructuredOutput};
use crate::utils::clean_json_output;

/// A capability the model may invoke during a single generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolGrant {
    WebSearch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    Document(Document),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: ChatRole,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            parts: vec![MessagePart::Text(text.into())],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            parts: vec![MessagePart::Text(text.into())],
        }
    }

    /// Instruction text followed by the documents, in order.
    pub fn user_with_documents(text: impl Into<String>, documents: Vec<Document>) -> Self {
        let mut parts = vec![MessagePart::Text(text.into())];
        parts.extend(documents.into_iter().map(MessagePart::Document));
        Self {
            role: ChatRole::User,
            parts,
        }
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text(t) => Some(t.as_str()),
                MessagePart::Document(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<&ChatTurn> for Message {
    fn from(turn: &ChatTurn) -> Self {
        Self {
            role: turn.role,
            parts: vec![MessagePart::Text(turn.content.clone())],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    /// Backend default applies when `None`.
    pub model: Option<String>,
    pub system_instruction: Option<String>,
    pub messages: Vec<Message>,
    /// Gemini-style JSON schema the reply must follow; `None` means free text.
    pub response_schema: Option<Value>,
    pub tools: BTreeSet<ToolGrant>,
}

/// A remote generative-model capability.
///
/// Implementations map transport and service failures onto
/// `RemoteUnavailable` (retryable) or `RemoteRejected` (auth, quota, policy)
/// and return the reply text unvalidated.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

pub struct GenerationClient {
    backend: Arc<dyn GenerativeModel>,
    timeout: Duration,
    malformed_retries: usize,
}

struct ParseFailure {
    reason: String,
    /// The reply, when it was at least valid JSON and can be patched.
    json: Option<Value>,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn GenerativeModel>) -> Self {
        Self::from_config(backend, &AdvisorConfig::default())
    }

    pub fn from_config(backend: Arc<dyn GenerativeModel>, config: &AdvisorConfig) -> Self {
        Self {
            backend,
            timeout: config.request_timeout(),
            malformed_retries: config.malformed_output_retries,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_malformed_retries(mut self, retries: usize) -> Self {
        self.malformed_retries = retries;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn call(&self, request: &GenerationRequest) -> Result<String> {
        debug!(
            "Calling {} (model: {}, messages: {}, tools: {:?}, structured: {})",
            self.backend.name(),
            request.model.as_deref().unwrap_or("<default>"),
            request.messages.len(),
            request.tools,
            request.response_schema.is_some()
        );

        match tokio::time::timeout(self.timeout, self.backend.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(AdvisorError::RemoteUnavailable(format!(
                "{} did not respond within {}s",
                self.backend.name(),
                self.timeout.as_secs_f32()
            ))),
        }
    }

    /// Free-text generation (chat mode). A blank reply is malformed output.
    pub async fn generate_text(&self, request: GenerationRequest) -> Result<String> {
        let reply = self.call(&request).await?;
        if reply.trim().is_empty() {
            return Err(AdvisorError::MalformedModelOutput(
                "model returned an empty reply".to_string(),
            ));
        }
        Ok(reply)
    }

    pub async fn generate_structured<T: StructuredOutput>(
        &self,
        request: GenerationRequest,
    ) -> Result<T> {
        self.generate_structured_checked(request, |_: &T| Ok(()))
            .await
    }

    /// Structured generation with an extra caller-supplied check.
    ///
    /// Output that fails deserialization, [`StructuredOutput::check`] or
    /// `check` is retried up to the configured budget. Valid-JSON failures are
    /// repaired with a JSON Patch requested from the model; anything else
    /// reissues the original request. Remote errors are never retried here.
    pub async fn generate_structured_checked<T, F>(
        &self,
        mut request: GenerationRequest,
        check: F,
    ) -> Result<T>
    where
        T: StructuredOutput,
        F: Fn(&T) -> std::result::Result<(), String> + Send + Sync,
    {
        request.response_schema = Some(gemini_response_schema::<T>()?);

        let mut raw = self.call(&request).await?;
        let mut retries_left = self.malformed_retries;

        loop {
            let failure = match parse_structured::<T, _>(&raw, &check) {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            if retries_left == 0 {
                return Err(AdvisorError::MalformedModelOutput(failure.reason));
            }
            retries_left -= 1;

            warn!(
                "Model output failed validation ({} retries left): {}",
                retries_left, failure.reason
            );

            raw = match failure.json {
                Some(bad_json) => self.repair(&request, bad_json, &failure.reason).await?,
                None => self.call(&request).await?,
            };
        }
    }

    /// Asks the model for an RFC 6902 patch against its own invalid reply and
    /// returns the patched document. A patch that cannot be parsed or applied
    /// leaves the document unchanged, which costs the caller one retry.
    async fn repair(
        &self,
        original: &GenerationRequest,
        mut bad_json: Value,
        error_msg: &str,
    ) -> Result<String> {
        let patch_prompt = format!(
            "The JSON you provided failed validation:\n\nERROR: {}\n\n\
            TASK: Return a JSON Patch (RFC 6902) array that fixes this. \
            Do NOT return the full JSON. Return ONLY the patch array.\n\
            Example: [{{ \"op\": \"add\", \"path\": \"/strategies\", \"value\": [] }}]",
            error_msg
        );

        let mut messages = original.messages.clone();
        messages.push(Message::model(bad_json.to_string()));
        messages.push(Message::user(patch_prompt));

        let repair_request = GenerationRequest {
            model: original.model.clone(),
            system_instruction: Some("You are a JSON Repair Agent.".to_string()),
            messages,
            response_schema: None,
            tools: BTreeSet::new(),
        };

        let patch_text = self.call(&repair_request).await?;
        let patch: json_patch::Patch = match serde_json::from_str(clean_json_output(&patch_text))
        {
            Ok(patch) => patch,
            Err(e) => {
                warn!("Discarding unparseable repair patch: {}", e);
                return Ok(bad_json.to_string());
            }
        };

        if let Err(e) = json_patch::patch(&mut bad_json, &patch) {
            warn!("{}", AdvisorError::from(e));
        }
        Ok(bad_json.to_string())
    }
}

fn parse_structured<T, F>(raw: &str, check: &F) -> std::result::Result<T, ParseFailure>
where
    T: StructuredOutput,
    F: Fn(&T) -> std::result::Result<(), String>,
{
    let value: Value = serde_json::from_str(clean_json_output(raw)).map_err(|e| ParseFailure {
        reason: format!("reply is not valid JSON: {}", e),
        json: None,
    })?;

    let parsed: T = serde_json::from_value(value.clone()).map_err(|e| ParseFailure {
        reason: e.to_string(),
        json: Some(value.clone()),
    })?;

    parsed
        .check()
        .and_then(|_| check(&parsed))
        .map_err(|reason| ParseFailure {
            reason,
            json: Some(value),
        })?;

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AnalysisResult;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        seen: Mutex<Vec<GenerationRequest>>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
                delay: None,
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerativeModel for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AdvisorError::RemoteUnavailable("script exhausted".into())))
        }
    }

    const VALID: &str = r#"{
        "documentTypes": [],
        "keyFigures": [],
        "financialHealthSummary": "Healthy.",
        "strategies": [],
        "executiveSummary": "Nothing to add."
    }"#;

    const MISSING_STRATEGIES: &str = r#"{
        "documentTypes": [],
        "keyFigures": [],
        "financialHealthSummary": "Healthy.",
        "executiveSummary": "Nothing to add."
    }"#;

    #[tokio::test]
    async fn test_structured_request_carries_schema() {
        let backend = Scripted::new(vec![Ok(VALID.to_string())]);
        let client = GenerationClient::new(backend.clone());

        let result: AnalysisResult = client
            .generate_structured(GenerationRequest::default())
            .await
            .unwrap();
        assert_eq!(result.executive_summary, "Nothing to add.");

        let seen = backend.seen.lock().unwrap();
        let schema = seen[0].response_schema.as_ref().unwrap();
        assert!(schema["properties"].get("strategies").is_some());
    }

    #[tokio::test]
    async fn test_malformed_output_without_retries_fails() {
        let backend = Scripted::new(vec![Ok(MISSING_STRATEGIES.to_string())]);
        let client = GenerationClient::new(backend.clone()).with_malformed_retries(0);

        let err = client
            .generate_structured::<AnalysisResult>(GenerationRequest::default())
            .await
            .unwrap_err();
        match err {
            AdvisorError::MalformedModelOutput(reason) => assert!(reason.contains("strategies")),
            other => panic!("expected MalformedModelOutput, got {:?}", other),
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_output_is_repaired_with_json_patch() {
        let backend = Scripted::new(vec![
            Ok(MISSING_STRATEGIES.to_string()),
            Ok(r#"```json
[{"op": "add", "path": "/strategies", "value": []}]
```"#
                .to_string()),
        ]);
        let client = GenerationClient::new(backend.clone()).with_malformed_retries(1);

        let result: AnalysisResult = client
            .generate_structured(GenerationRequest {
                messages: vec![Message::user("analyze")],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.strategies.is_empty());

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let repair = &seen[1];
        assert!(repair.response_schema.is_none());
        assert!(repair.tools.is_empty());
        assert_eq!(repair.messages.len(), 3);
        assert_eq!(repair.messages[1].role, ChatRole::Model);
        assert!(repair.messages[2].text().contains("JSON Patch"));
    }

    #[tokio::test]
    async fn test_non_json_reply_reissues_original_request() {
        let backend = Scripted::new(vec![
            Ok("I'm sorry, here is a summary in prose.".to_string()),
            Ok(VALID.to_string()),
        ]);
        let client = GenerationClient::new(backend.clone()).with_malformed_retries(1);

        let request = GenerationRequest {
            messages: vec![Message::user("analyze")],
            tools: BTreeSet::from([ToolGrant::WebSearch]),
            ..Default::default()
        };
        let _: AnalysisResult = client.generate_structured(request).await.unwrap();

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn test_remote_errors_are_not_retried() {
        let backend = Scripted::new(vec![
            Err(AdvisorError::RemoteRejected("quota exceeded".into())),
            Ok(VALID.to_string()),
        ]);
        let client = GenerationClient::new(backend.clone()).with_malformed_retries(3);

        let err = client
            .generate_structured::<AnalysisResult>(GenerationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdvisorError::RemoteRejected(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_custom_check_failure_is_malformed() {
        let backend = Scripted::new(vec![Ok(VALID.to_string())]);
        let client = GenerationClient::new(backend).with_malformed_retries(0);

        let err = client
            .generate_structured_checked(GenerationRequest::default(), |r: &AnalysisResult| {
                if r.what_if_analysis.is_none() {
                    Err("whatIfAnalysis missing".to_string())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AdvisorError::MalformedModelOutput(_)));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_remote_unavailable() {
        let backend = Arc::new(Scripted {
            replies: Mutex::new(VecDeque::from([Ok("late".to_string())])),
            seen: Mutex::new(Vec::new()),
            delay: Some(Duration::from_millis(200)),
        });
        let client = GenerationClient::new(backend).with_timeout(Duration::from_millis(10));

        let err = client
            .generate_text(GenerationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdvisorError::RemoteUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_blank_text_reply_is_malformed() {
        let backend = Scripted::new(vec![Ok("   \n".to_string())]);
        let client = GenerationClient::new(backend);

        let err = client
            .generate_text(GenerationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdvisorError::MalformedModelOutput(_)));
    }
}
