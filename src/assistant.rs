use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::AdvisorConfig;
use crate::error::{AdvisorError, Result};
use crate::generation::{GenerationClient, GenerationRequest, GenerativeModel, Message, ToolGrant};
use crate::prompts::build_chat_grounding;
use crate::schema::{AnalysisResult, ChatHistory, ChatRole, ChatTurn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    /// Grants the model a web-search tool for questions the report cannot answer.
    pub allow_external_lookup: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            allow_external_lookup: true,
        }
    }
}

impl From<&AdvisorConfig> for ChatOptions {
    fn from(config: &AdvisorConfig) -> Self {
        Self {
            allow_external_lookup: config.allow_external_lookup,
        }
    }
}

/// Follow-up chat grounded in a finished report.
pub struct ReportAssistant {
    client: GenerationClient,
    model: String,
}

impl ReportAssistant {
    pub fn new(backend: Arc<dyn GenerativeModel>, config: &AdvisorConfig) -> Self {
        Self {
            client: GenerationClient::from_config(backend, config),
            model: config.chat_model.clone(),
        }
    }

    pub fn from_client(client: GenerationClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Answers the last (user) turn of `history` using only `report`, plus a
    /// disclosed web search when `options` allow it. Neither argument is
    /// modified.
    pub async fn chat(
        &self,
        report: &AnalysisResult,
        history: &[ChatTurn],
        options: ChatOptions,
    ) -> Result<String> {
        validate_history(history)?;

        info!(
            "Report chat: {} turn(s), external lookup: {}",
            history.len(),
            options.allow_external_lookup
        );

        let mut tools = BTreeSet::new();
        if options.allow_external_lookup {
            tools.insert(ToolGrant::WebSearch);
        }

        let request = GenerationRequest {
            model: Some(self.model.clone()),
            system_instruction: Some(build_chat_grounding(
                report,
                options.allow_external_lookup,
            )?),
            messages: history.iter().map(Message::from).collect(),
            response_schema: None,
            tools,
        };

        match self.client.generate_text(request).await {
            Ok(reply) => Ok(reply.trim().to_string()),
            // chat has no schema; an unusable reply is a failed call
            Err(AdvisorError::MalformedModelOutput(reason)) => Err(
                AdvisorError::RemoteUnavailable(format!("assistant gave no usable reply: {}", reason)),
            ),
            Err(e) => Err(e),
        }
    }
}

fn validate_history(history: &[ChatTurn]) -> Result<()> {
    let last = history.last().ok_or_else(|| {
        AdvisorError::InvalidChatState("chat history is empty".to_string())
    })?;

    if last.role != ChatRole::User {
        return Err(AdvisorError::InvalidChatState(
            "the last chat turn must come from the user".to_string(),
        ));
    }
    if last.content.trim().is_empty() {
        return Err(AdvisorError::InvalidChatState(
            "the user question is empty".to_string(),
        ));
    }
    Ok(())
}

/// A transcript bound to one report.
///
/// [`ask`](ChatSession::ask) appends the question optimistically and removes
/// it again when the call fails, so the history only ever holds answered
/// questions.
pub struct ChatSession<'a> {
    assistant: &'a ReportAssistant,
    report: &'a AnalysisResult,
    history: ChatHistory,
    options: ChatOptions,
}

impl<'a> ChatSession<'a> {
    pub fn new(
        assistant: &'a ReportAssistant,
        report: &'a AnalysisResult,
        options: ChatOptions,
    ) -> Self {
        Self {
            assistant,
            report,
            history: Vec::new(),
            options,
        }
    }

    /// Resumes a saved transcript.
    pub fn with_history(mut self, history: ChatHistory) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn into_history(self) -> ChatHistory {
        self.history
    }

    pub async fn ask(&mut self, question: impl Into<String>) -> Result<String> {
        self.history.push(ChatTurn::user(question));

        match self
            .assistant
            .chat(self.report, &self.history, self.options)
            .await
        {
            Ok(reply) => {
                self.history.push(ChatTurn::model(reply.clone()));
                Ok(reply)
            }
            Err(e) => {
                self.history.pop();
                Err(e)
            }
        }
    }
}
