use log::{debug, info};
use std::sync::Arc;

use crate::config::AdvisorConfig;
use crate::error::Result;
use crate::generation::{GenerationClient, GenerationRequest, GenerativeModel, Message};
use crate::prompts::build_analysis_prompt;
use crate::schema::{AnalysisRequest, AnalysisResult};

/// Single-shot tax analysis: validate, build the prompt, generate a
/// schema-conformant [`AnalysisResult`]. Holds no per-request state.
pub struct TaxAnalyzer {
    client: GenerationClient,
    model: String,
}

impl TaxAnalyzer {
    pub fn new(backend: Arc<dyn GenerativeModel>, config: &AdvisorConfig) -> Self {
        Self {
            client: GenerationClient::from_config(backend, config),
            model: config.analysis_model.clone(),
        }
    }

    pub fn from_client(client: GenerationClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        let validated = request.validate()?;
        let model = validated.model_override.unwrap_or(&self.model);

        info!(
            "Analyzing for {} ({:?}): {} document(s), structured data: {}, notes: {}, model: {}",
            validated.jurisdiction,
            validated.profile_type,
            validated.documents.len(),
            validated.financials.is_some(),
            validated.narrative_notes.is_some(),
            model
        );

        let plan = build_analysis_prompt(&validated);
        debug!("Analysis prompt is {} characters", plan.instruction_text.len());

        let generation = GenerationRequest {
            model: Some(model.to_string()),
            system_instruction: None,
            messages: vec![Message::user_with_documents(
                plan.instruction_text,
                plan.attachments,
            )],
            response_schema: None,
            tools: plan.tool_grants,
        };

        let notes_given = validated.narrative_notes.is_some();
        let mut result: AnalysisResult = self
            .client
            .generate_structured_checked(generation, |r: &AnalysisResult| {
                check_what_if(r, notes_given)
            })
            .await?;

        normalize_what_if(&mut result, notes_given);

        info!(
            "Analysis complete: {} strategies, {} key figures",
            result.strategies.len(),
            result.key_figures.len()
        );
        Ok(result)
    }
}

fn check_what_if(result: &AnalysisResult, notes_given: bool) -> std::result::Result<(), String> {
    let present = result
        .what_if_analysis
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty());

    if notes_given && !present {
        return Err(
            "`whatIfAnalysis` must be a non-empty string because the client supplied notes"
                .to_string(),
        );
    }
    Ok(())
}

/// `whatIfAnalysis` exists iff the client supplied notes. Other fields are
/// never touched.
fn normalize_what_if(result: &mut AnalysisResult, notes_given: bool) {
    let blank = result
        .what_if_analysis
        .as_deref()
        .is_some_and(|s| s.trim().is_empty());

    if !notes_given || blank {
        result.what_if_analysis = None;
    }
}
