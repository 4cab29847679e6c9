// Prompt construction for the analysis and report-chat flows. Everything here
// is pure: identical input yields identical output, and no clock is consulted.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::generation::ToolGrant;
use crate::ingestion::Document;
use crate::schema::{AnalysisResult, FinancialCategory, StructuredFinancials, ValidatedRequest};
use crate::utils::create_document_manifest;

/// What the analyzer sends to the model for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPlan {
    pub instruction_text: String,
    pub attachments: Vec<Document>,
    pub tool_grants: BTreeSet<ToolGrant>,
}

pub const NO_INPUT_NOTICE: &str = "NO INPUT DATA: The client supplied neither documents nor structured financial data, so this analysis relies on no input data.";

const ANALYSIS_CORE_INSTRUCTIONS: &str = r#"
## CORE ANALYSIS INSTRUCTIONS
Work through these steps in order.

1. **Identify Document Types:** For each attached document, identify its type (e.g., "US Form 1040", "Profit and Loss Statement", "Balance Sheet", "ITR-V (India)"). Only classify documents that are actually attached. If no documents are attached, `documentTypes` MUST be an empty array.
2. **Extract Key Financial Figures:** Consolidate the most relevant figures (Total Income, Gross Profit, Net Income, Total Deductions, Taxable Income, key asset/liability values) from the structured data and the attached documents. Only report figures that appear in, or follow directly from, the supplied content. Never invent figures. Keep values as readable strings with currency symbols, ranges or units.
3. **Assess Overall Financial Health:** Write `financialHealthSummary` as a detailed narrative synthesizing all sources: strengths, weaknesses, trends and areas of concern.
4. **Develop Tax Strategies:** Produce specific, actionable strategies grounded in the current tax law of the jurisdiction and the client's situation. Use web search to confirm that thresholds, limits and rules are current. For each strategy provide:
   - `title`: a clear title.
   - `description`: a detailed explanation of the strategy and its benefits.
   - `action`: a concrete next step for the client.
   - `relevantSection`: the section of the tax code or law that applies.
   - `potentialSavings`: a realistic estimate as a string in local currency, either an amount or a "low - high" range (e.g., "$2,000 - $3,000" or "₹50,000 - ₹75,000").
"#;

const MULTI_PERIOD_INSTRUCTIONS: &str = "If the supplied data covers more than one tax period or entity, identify each period or entity, analyze them separately where it matters, and call out year-over-year changes.";

const EXECUTIVE_SUMMARY_INSTRUCTIONS: &str = r#"
6. **Generate an Executive Summary LAST:** Only after the strategies, the financial health assessment and any what-if analysis are complete, write `executiveSummary`: a brief, high-level summary of the key findings and the total estimated potential tax savings. It must be consistent with the sections above.

## OUTPUT
Return ONLY valid JSON matching the response schema. Every array field must be present, using an empty array when there is nothing to report.
"#;

/// Builds the single analysis instruction, its attachments and tool grants.
pub fn build_analysis_prompt(request: &ValidatedRequest<'_>) -> PromptPlan {
    let mut text = String::new();
    let profile = request.profile_type.label();

    text.push_str(&format!(
        "You are a world-class tax consultant and financial analyst providing services for clients in {}.\n",
        request.jurisdiction
    ));
    text.push_str(&format!(
        "Your task is to conduct a comprehensive analysis of the client's financial documents and structured financial data for a client who has requested a \"{}\" analysis.\n",
        profile
    ));
    text.push_str("Your response must be professional and insightful, and provide a clear, actionable tax-saving plan and a holistic financial health assessment.\n\n");

    text.push_str("## CLIENT PROFILE\n");
    text.push_str(&format!("- Tax jurisdiction: {}\n", request.jurisdiction));
    text.push_str(&format!("- Profile type: {}\n", profile));
    match request.tax_period {
        Some(period) => text.push_str(&format!("- Primary tax period: {}\n", period)),
        None => text.push_str(
            "- Primary tax period: Not specified. Infer it from the supplied data.\n",
        ),
    }
    text.push_str(&format!("{}\n\n", MULTI_PERIOD_INSTRUCTIONS));

    text.push_str(&input_sources_section(request));
    text.push_str(ANALYSIS_CORE_INSTRUCTIONS);
    text.push_str(&what_if_section(request.narrative_notes));
    text.push_str(EXECUTIVE_SUMMARY_INSTRUCTIONS);

    PromptPlan {
        instruction_text: text,
        attachments: request.documents.to_vec(),
        // tax law changes yearly; analysis always gets live lookup
        tool_grants: BTreeSet::from([ToolGrant::WebSearch]),
    }
}

fn input_sources_section(request: &ValidatedRequest<'_>) -> String {
    let mut text = String::from("## INPUT DATA\n");

    if request.documents.is_empty() && request.financials.is_none() {
        text.push_str(&format!("{}\n", NO_INPUT_NOTICE));
        text.push_str(
            "State plainly in `financialHealthSummary` and `executiveSummary` that there is insufficient information for a personalized analysis. \
            Leave `documentTypes` and `keyFigures` empty, and limit strategies to general options commonly available to this profile in this jurisdiction, \
            with potential savings stated as unknown or indicative.\n\n",
        );
        return text;
    }

    text.push_str("**Prioritize the structured data provided by the client, and use the attached documents as supplementary information or for cross-verification.**\n\n");

    text.push_str("### Structured Client-Provided Data\n");
    match request.financials {
        Some(financials) => text.push_str(&render_financials(financials)),
        None => text.push_str("No structured financial data was provided.\n"),
    }
    text.push('\n');

    if request.documents.is_empty() {
        text.push_str("### Documents\nNo documents were uploaded. Base your analysis solely on the structured data provided.\n\n");
    } else {
        text.push_str(&create_document_manifest(request.documents));
        text.push('\n');
    }

    text
}

fn render_financials(financials: &StructuredFinancials) -> String {
    let mut text = String::new();
    render_category(&mut text, &financials.income_and_investments);
    render_category(&mut text, &financials.deductions_and_credits);
    render_category(&mut text, &financials.business_and_rental);
    text
}

fn render_category<C: FinancialCategory>(out: &mut String, category: &C) {
    out.push_str(&format!("- **{}:**\n", C::TITLE));
    let provided = category.provided();
    if provided.is_empty() {
        out.push_str("  - Not Provided\n");
        return;
    }
    for (label, value) in provided {
        out.push_str(&format!("  - {}: {}\n", label, value));
    }
}

fn what_if_section(notes: Option<&str>) -> String {
    match notes {
        Some(notes) => format!(
            "5. **Address the Client's Notes (What-If Analysis):** The client has provided the notes, questions or goals below. \
            You MUST address them in a dedicated `whatIfAnalysis` section. Directly answer their questions or model the scenarios they describe, \
            quantifying the effect where possible. This section is distinct from the main strategy recommendations but may reference them.\n\
            Client notes:\n\"\"\"\n{}\n\"\"\"\n",
            notes
        ),
        None => "5. **What-If Analysis:** The client has not provided any notes. Omit the `whatIfAnalysis` field.\n"
            .to_string(),
    }
}

/// The one encoder used to embed a report in chat grounding.
pub fn encode_report(report: &AnalysisResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

const CHAT_PERSONA: &str = r#"You are an expert financial assistant. Your role is to answer follow-up questions from the user based on the detailed financial analysis report provided below.
Be helpful, clear, and concise. Do not provide financial advice, but explain concepts and the information in the report clearly.
Base your answers ONLY on the provided report context."#;

const CHAT_LOOKUP_ENABLED: &str = r#"
**Web Search Instructions:**
If the user asks a question that CANNOT be answered from the report, use the web search tool to find an answer.
When you use web search, you MUST:
1. Clearly state that the information comes from a web search and is not part of their personal report (e.g., "I looked this up online and found that...").
2. Format the answer in a clean, readable way, using bullet points or short paragraphs.
3. Synthesize the information into a helpful response. Do not just copy search results."#;

const CHAT_LOOKUP_DISABLED: &str = r#"
**No External Lookup:**
You have no web search or any other external lookup. If a question cannot be answered from the report, say that the report does not contain that information.
Never claim or imply that you searched the web or looked anything up."#;

/// Marker lines around the embedded report.
pub const REPORT_BLOCK_START: &str = "```json";
pub const REPORT_BLOCK_END: &str = "```";

/// System instruction grounding the chat in `report`. The report is embedded
/// verbatim through [`encode_report`].
pub fn build_chat_grounding(report: &AnalysisResult, allow_external_lookup: bool) -> Result<String> {
    let lookup = if allow_external_lookup {
        CHAT_LOOKUP_ENABLED
    } else {
        CHAT_LOOKUP_DISABLED
    };

    Ok(format!(
        "{}\n{}\n\nHere is the user's financial report:\n{}\n{}\n{}",
        CHAT_PERSONA,
        lookup,
        REPORT_BLOCK_START,
        encode_report(report)?,
        REPORT_BLOCK_END
    ))
}
