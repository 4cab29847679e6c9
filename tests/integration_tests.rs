use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tax_strategy_advisor::*;

/// Stands in for the remote model: replays canned replies and records every
/// request it receives.
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn replying(reply: serde_json::Value) -> Arc<Self> {
        Self::new(vec![Ok(reply.to_string())])
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerativeModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AdvisorError::RemoteUnavailable("no scripted reply".into())))
    }
}

fn config() -> AdvisorConfig {
    AdvisorConfig::default().with_malformed_output_retries(0)
}

fn basic_request() -> AnalysisRequest {
    serde_json::from_value(json!({
        "documents": [],
        "jurisdiction": "United States",
        "profileType": "Individual",
        "structuredFinancials": { "income": { "employmentIncome": "80000" } }
    }))
    .unwrap()
}

fn report_json(what_if: Option<&str>) -> serde_json::Value {
    let mut report = json!({
        "documentTypes": [],
        "keyFigures": [{ "name": "Employment Income", "value": "$80,000" }],
        "financialHealthSummary": "Single salaried income with room for tax-advantaged saving.",
        "strategies": [{
            "title": "Maximize 401k",
            "description": "Increase pre-tax 401(k) deferrals toward the annual limit.",
            "action": "Raise your payroll deferral percentage.",
            "relevantSection": "IRC §402(g)",
            "potentialSavings": "$1,100 - $2,200"
        }],
        "executiveSummary": "One strategy identified worth $1,100 - $2,200."
    });
    if let Some(text) = what_if {
        report["whatIfAnalysis"] = json!(text);
    }
    report
}

fn sample_report() -> AnalysisResult {
    serde_json::from_value(report_json(None)).unwrap()
}

#[tokio::test]
async fn test_basic_analysis_scenario() {
    let model = ScriptedModel::replying(report_json(None));
    let analyzer = TaxAnalyzer::new(model.clone(), &config());

    let result = analyzer.analyze(&basic_request()).await.unwrap();
    assert!(result.document_types.is_empty());
    assert!(!result.strategies.is_empty());
    assert!(!result.executive_summary.is_empty());
    assert!(result.what_if_analysis.is_none());

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.model.as_deref(), Some("gemini-2.5-pro"));
    assert!(request.tools.contains(&ToolGrant::WebSearch));
    assert!(request.response_schema.is_some());

    let prompt = request.messages[0].text();
    assert!(prompt.contains("United States"));
    assert!(prompt.contains("Employment Income: 80000"));
}

#[tokio::test]
async fn test_result_is_returned_unchanged() {
    let model = ScriptedModel::replying(report_json(None));
    let analyzer = TaxAnalyzer::new(model, &config());

    let result = analyzer.analyze(&basic_request()).await.unwrap();
    assert_eq!(result, sample_report());
    assert_eq!(result.strategies[0].potential_savings, "$1,100 - $2,200");
}

#[tokio::test]
async fn test_fenced_report_after_bracketed_prose_is_accepted() {
    let reply = format!(
        "Based on the [2024] IRS limits, here is the report:\n```json\n{}\n```",
        serde_json::to_string_pretty(&report_json(None)).unwrap()
    );
    let model = ScriptedModel::new(vec![Ok(reply)]);
    let analyzer = TaxAnalyzer::new(model.clone(), &config());

    let result = analyzer.analyze(&basic_request()).await.unwrap();
    assert_eq!(result, sample_report());
    assert_eq!(model.requests().len(), 1);
}

#[tokio::test]
async fn test_what_if_present_only_with_notes() {
    let notes = "What if I contribute $5000 more to retirement?";
    let model = ScriptedModel::replying(report_json(Some(
        "Contributing an extra $5000 to retirement would cut taxable income by $5000.",
    )));
    let analyzer = TaxAnalyzer::new(model.clone(), &config());

    let request = basic_request().with_notes(notes);
    let result = analyzer.analyze(&request).await.unwrap();
    assert!(result.what_if_analysis.unwrap().contains("$5000"));
    assert!(model.requests()[0].messages[0].text().contains(notes));

    // a what-if section nobody asked for is dropped
    let model = ScriptedModel::replying(report_json(Some("Unrequested scenario.")));
    let analyzer = TaxAnalyzer::new(model, &config());
    let result = analyzer.analyze(&basic_request()).await.unwrap();
    assert!(result.what_if_analysis.is_none());
}

#[tokio::test]
async fn test_missing_what_if_with_notes_is_malformed() {
    let model = ScriptedModel::replying(report_json(None));
    let analyzer = TaxAnalyzer::new(model, &config());

    let request = basic_request().with_notes("Should I form an LLC?");
    let err = analyzer.analyze(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedModelOutput);
}

#[tokio::test]
async fn test_missing_strategies_is_malformed_output() {
    let mut reply = report_json(None);
    reply.as_object_mut().unwrap().remove("strategies");
    let model = ScriptedModel::replying(reply);
    let analyzer = TaxAnalyzer::new(model, &config());

    let err = analyzer.analyze(&basic_request()).await.unwrap_err();
    match err {
        AdvisorError::MalformedModelOutput(reason) => assert!(reason.contains("strategies")),
        other => panic!("expected MalformedModelOutput, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_output_retry_budget_repairs_result() {
    let mut reply = report_json(None);
    reply.as_object_mut().unwrap().remove("strategies");
    let patch = json!([{ "op": "add", "path": "/strategies", "value": [] }]);
    let model = ScriptedModel::new(vec![Ok(reply.to_string()), Ok(patch.to_string())]);
    let analyzer = TaxAnalyzer::new(model.clone(), &config().with_malformed_output_retries(1));

    let result = analyzer.analyze(&basic_request()).await.unwrap();
    assert!(result.strategies.is_empty());
    assert_eq!(model.requests().len(), 2);
}

#[tokio::test]
async fn test_validation_fails_before_any_remote_call() {
    let model = ScriptedModel::replying(report_json(None));
    let analyzer = TaxAnalyzer::new(model.clone(), &config());

    let mut request = basic_request();
    request.jurisdiction = String::new();
    let err = analyzer.analyze(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut request = basic_request();
    request.profile_type = "Partnership".to_string();
    let err = analyzer.analyze(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn test_remote_failures_propagate_typed() {
    let model = ScriptedModel::new(vec![Err(AdvisorError::RemoteRejected("API key invalid".into()))]);
    let analyzer = TaxAnalyzer::new(model, &config());
    let err = analyzer.analyze(&basic_request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteRejected);
    assert!(!err.is_retryable());

    let model = ScriptedModel::new(vec![Err(AdvisorError::RemoteUnavailable("reset".into()))]);
    let analyzer = TaxAnalyzer::new(model, &config());
    let err = analyzer.analyze(&basic_request()).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_documents_and_model_override_reach_the_model() {
    let model = ScriptedModel::replying(report_json(None));
    let analyzer = TaxAnalyzer::new(model.clone(), &config());

    let doc = Document::from_data_uri("w2.pdf", "data:application/pdf;base64,JVBERi0=").unwrap();
    let request = basic_request()
        .with_document(doc.clone())
        .with_model_override("gemini-2.5-flash");
    analyzer.analyze(&request).await.unwrap();

    let sent = &model.requests()[0];
    assert_eq!(sent.model.as_deref(), Some("gemini-2.5-flash"));
    let parts = &sent.messages[0].parts;
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[1], MessagePart::Document(doc));
}

#[tokio::test]
async fn test_chat_grounding_scenario() {
    let model = ScriptedModel::new(vec![Ok(
        "Strategy 1 is \"Maximize 401k\": raise your payroll deferral.".to_string(),
    )]);
    let assistant = ReportAssistant::new(model.clone(), &config());
    let report = sample_report();
    let history = vec![ChatTurn::user("What is strategy 1?")];

    let reply = assistant
        .chat(
            &report,
            &history,
            ChatOptions {
                allow_external_lookup: false,
            },
        )
        .await
        .unwrap();
    assert!(!reply.is_empty());

    let sent = &model.requests()[0];
    assert!(sent.tools.is_empty());
    assert!(sent.response_schema.is_none());
    assert_eq!(sent.model.as_deref(), Some("gemini-2.5-flash"));
    let system = sent.system_instruction.as_ref().unwrap();
    assert!(system.contains("Maximize 401k"));
    assert!(system.contains("Never claim or imply that you searched the web"));
    assert_eq!(sent.messages.len(), 1);
    assert_eq!(sent.messages[0].text(), "What is strategy 1?");

    // inputs are read-only
    assert_eq!(report, sample_report());
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_chat_with_external_lookup_grants_web_search() {
    let model = ScriptedModel::new(vec![Ok("I looked this up online and found...".to_string())]);
    let assistant = ReportAssistant::new(model.clone(), &config());

    let history = vec![
        ChatTurn::user("What is strategy 1?"),
        ChatTurn::model("Maximize 401k."),
        ChatTurn::user("What is the 2024 401k limit?"),
    ];
    assistant
        .chat(&sample_report(), &history, ChatOptions::default())
        .await
        .unwrap();

    let sent = &model.requests()[0];
    assert!(sent.tools.contains(&ToolGrant::WebSearch));
    assert_eq!(sent.messages.len(), 3);
    assert_eq!(sent.messages[1].role, ChatRole::Model);
    assert!(sent
        .system_instruction
        .as_ref()
        .unwrap()
        .contains("not part of their personal report"));
}

#[tokio::test]
async fn test_chat_rejects_invalid_history_without_calling_model() {
    let model = ScriptedModel::new(vec![]);
    let assistant = ReportAssistant::new(model.clone(), &config());
    let report = sample_report();

    let err = assistant
        .chat(&report, &[], ChatOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidChatState);

    let history = vec![ChatTurn::user("Hi"), ChatTurn::model("Hello!")];
    let err = assistant
        .chat(&report, &history, ChatOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidChatState);

    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn test_chat_empty_reply_is_remote_unavailable() {
    let model = ScriptedModel::new(vec![Ok("  ".to_string())]);
    let assistant = ReportAssistant::new(model, &config());

    let err = assistant
        .chat(&sample_report(), &[ChatTurn::user("Hi")], ChatOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
}

#[tokio::test]
async fn test_chat_session_rolls_back_failed_turns() {
    let model = ScriptedModel::new(vec![
        Ok("It is \"Maximize 401k\".".to_string()),
        Err(AdvisorError::RemoteUnavailable("connection reset".into())),
        Ok("About $1,100 - $2,200.".to_string()),
    ]);
    let assistant = ReportAssistant::new(model.clone(), &config());
    let report = sample_report();
    let mut session = ChatSession::new(&assistant, &report, ChatOptions::default());

    session.ask("What is strategy 1?").await.unwrap();
    assert_eq!(session.history().len(), 2);

    let err = session.ask("How much will it save?").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(session.history().len(), 2);
    assert_eq!(session.history()[1].role, ChatRole::Model);

    let reply = session.ask("How much will it save?").await.unwrap();
    assert_eq!(reply, "About $1,100 - $2,200.");

    let history = session.into_history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2], ChatTurn::user("How much will it save?"));

    // the retried call carried exactly one copy of the question
    let last_sent = model.requests().pop().unwrap();
    assert_eq!(last_sent.messages.len(), 3);
}

#[tokio::test]
async fn test_analysis_to_saved_report_flow() -> anyhow::Result<()> {
    let model = ScriptedModel::replying(report_json(None));
    let analyzer = TaxAnalyzer::new(model, &config());

    let request = basic_request().with_tax_period("2024");
    let result = analyzer.analyze(&request).await?;

    let inputs = ReportInputs::from(&request.validate()?);
    let report = Report::named_after_inputs(result.clone(), inputs);
    assert_eq!(report.name, "United States - Individual/Personal (2024)");

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("reports.json");
    let mut store = JsonFileReportStore::open(&path)?;
    store.add(report.clone())?;
    store.rename(&report.id, "2024 return")?;

    let reopened = JsonFileReportStore::open(&path)?;
    let stored = reopened
        .get(&report.id)?
        .ok_or_else(|| anyhow::anyhow!("report was not persisted"))?;
    assert_eq!(stored.name, "2024 return");
    assert_eq!(stored.result, result);
    assert_eq!(stored.inputs.tax_period.as_deref(), Some("2024"));
    Ok(())
}
