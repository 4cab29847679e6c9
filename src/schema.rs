use crate::error::{AdvisorError, Result};
use crate::ingestion::Document;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Request side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum ProfileType {
    Individual,
    SmallBusiness,
    Corporation,
}

impl ProfileType {
    /// The label shown to the model and to users.
    pub fn label(&self) -> &'static str {
        match self {
            ProfileType::Individual => "Individual/Personal",
            ProfileType::SmallBusiness => "Small Business/LLC",
            ProfileType::Corporation => "Corporation",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ProfileType {
    type Err = AdvisorError;

    /// Accepts canonical names (`SmallBusiness`) and the form labels
    /// (`Small Business/LLC`), ignoring case, spaces and punctuation.
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match key.as_str() {
            "individual" | "individualpersonal" | "personal" => Ok(ProfileType::Individual),
            "smallbusiness" | "smallbusinessllc" | "llc" => Ok(ProfileType::SmallBusiness),
            "corporation" | "corp" => Ok(ProfileType::Corporation),
            _ => Err(AdvisorError::Validation(format!(
                "Unrecognized profile type '{}': expected Individual, SmallBusiness or Corporation",
                s
            ))),
        }
    }
}

/// A user-entered figure. Forms send either numbers or free text such as "$80,000".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinancialValue {
    Number(f64),
    Text(String),
}

impl FinancialValue {
    pub fn is_blank(&self) -> bool {
        match self {
            FinancialValue::Number(n) => !n.is_finite(),
            FinancialValue::Text(t) => t.trim().is_empty(),
        }
    }
}

impl fmt::Display for FinancialValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinancialValue::Number(n) => write!(f, "{}", n),
            FinancialValue::Text(t) => f.write_str(t.trim()),
        }
    }
}

impl From<&str> for FinancialValue {
    fn from(value: &str) -> Self {
        FinancialValue::Text(value.to_string())
    }
}

impl From<String> for FinancialValue {
    fn from(value: String) -> Self {
        FinancialValue::Text(value)
    }
}

impl From<f64> for FinancialValue {
    fn from(value: f64) -> Self {
        FinancialValue::Number(value)
    }
}

/// One of the three fixed groups of structured financial hints.
pub trait FinancialCategory {
    const TITLE: &'static str;

    /// Known fields in display order, paired with their human-readable label.
    fn known_fields(&self) -> Vec<(&'static str, Option<&FinancialValue>)>;

    /// Additional named fields that are not part of the fixed catalogue.
    fn other_fields(&self) -> &BTreeMap<String, FinancialValue>;

    /// Every non-blank field as `(label, value)`.
    fn provided(&self) -> Vec<(String, &FinancialValue)> {
        let mut out: Vec<(String, &FinancialValue)> = self
            .known_fields()
            .into_iter()
            .filter_map(|(label, value)| {
                value
                    .filter(|v| !v.is_blank())
                    .map(|v| (label.to_string(), v))
            })
            .collect();

        out.extend(
            self.other_fields()
                .iter()
                .filter(|(_, v)| !v.is_blank())
                .map(|(k, v)| (k.clone(), v)),
        );
        out
    }

    fn is_empty(&self) -> bool {
        self.provided().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeAndInvestments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employment_income: Option<FinancialValue>,
    /// Dividends, capital gains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investment_income: Option<FinancialValue>,
    /// 401(k), IRA and similar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retirement_contributions: Option<FinancialValue>,
    #[serde(flatten)]
    pub other: BTreeMap<String, FinancialValue>,
}

impl FinancialCategory for IncomeAndInvestments {
    const TITLE: &'static str = "Income & Investments";

    fn known_fields(&self) -> Vec<(&'static str, Option<&FinancialValue>)> {
        vec![
            ("Employment Income", self.employment_income.as_ref()),
            (
                "Investment Income (dividends, capital gains)",
                self.investment_income.as_ref(),
            ),
            (
                "Retirement Contributions (401k, IRA)",
                self.retirement_contributions.as_ref(),
            ),
        ]
    }

    fn other_fields(&self) -> &BTreeMap<String, FinancialValue> {
        &self.other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductionsAndCredits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mortgage_interest: Option<FinancialValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charitable_donations: Option<FinancialValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_loan_interest: Option<FinancialValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_deductions: Option<FinancialValue>,
    #[serde(flatten)]
    pub other: BTreeMap<String, FinancialValue>,
}

impl FinancialCategory for DeductionsAndCredits {
    const TITLE: &'static str = "Deductions & Credits";

    fn known_fields(&self) -> Vec<(&'static str, Option<&FinancialValue>)> {
        vec![
            ("Mortgage Interest", self.mortgage_interest.as_ref()),
            ("Charitable Donations", self.charitable_donations.as_ref()),
            ("Student Loan Interest", self.student_loan_interest.as_ref()),
            ("Other Key Deductions", self.other_deductions.as_ref()),
        ]
    }

    fn other_fields(&self) -> &BTreeMap<String, FinancialValue> {
        &self.other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessAndRental {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_revenue: Option<FinancialValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_expenses: Option<FinancialValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rental_income: Option<FinancialValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rental_expenses: Option<FinancialValue>,
    #[serde(flatten)]
    pub other: BTreeMap<String, FinancialValue>,
}

impl FinancialCategory for BusinessAndRental {
    const TITLE: &'static str = "Business & Rental Income";

    fn known_fields(&self) -> Vec<(&'static str, Option<&FinancialValue>)> {
        vec![
            ("Business Revenue", self.business_revenue.as_ref()),
            ("Business Expenses", self.business_expenses.as_ref()),
            ("Rental Income", self.rental_income.as_ref()),
            ("Rental Expenses", self.rental_expenses.as_ref()),
        ]
    }

    fn other_fields(&self) -> &BTreeMap<String, FinancialValue> {
        &self.other
    }
}

/// Informational hints grouped into the three fixed categories. Values are not
/// validated numerically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredFinancials {
    #[serde(default, alias = "income")]
    pub income_and_investments: IncomeAndInvestments,
    #[serde(default, alias = "deductions")]
    pub deductions_and_credits: DeductionsAndCredits,
    #[serde(default, alias = "business")]
    pub business_and_rental: BusinessAndRental,
}

impl StructuredFinancials {
    pub fn is_empty(&self) -> bool {
        self.income_and_investments.is_empty()
            && self.deductions_and_credits.is_empty()
            && self.business_and_rental.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub jurisdiction: String,
    /// Wire form of [`ProfileType`]; checked by [`AnalysisRequest::validate`].
    #[serde(default)]
    pub profile_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_financials: Option<StructuredFinancials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
}

impl AnalysisRequest {
    pub fn new(jurisdiction: impl Into<String>, profile_type: ProfileType) -> Self {
        Self {
            jurisdiction: jurisdiction.into(),
            profile_type: format!("{:?}", profile_type),
            ..Default::default()
        }
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.documents.push(document);
        self
    }

    pub fn with_tax_period(mut self, period: impl Into<String>) -> Self {
        self.tax_period = Some(period.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.narrative_notes = Some(notes.into());
        self
    }

    pub fn with_financials(mut self, financials: StructuredFinancials) -> Self {
        self.structured_financials = Some(financials);
        self
    }

    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    /// Structural validation. Only jurisdiction and profile type are required;
    /// blank optional strings are treated as absent.
    pub fn validate(&self) -> Result<ValidatedRequest<'_>> {
        let jurisdiction = self.jurisdiction.trim();
        if jurisdiction.is_empty() {
            return Err(AdvisorError::Validation(
                "jurisdiction is required".to_string(),
            ));
        }

        if self.profile_type.trim().is_empty() {
            return Err(AdvisorError::Validation(
                "profileType is required".to_string(),
            ));
        }
        let profile_type = self.profile_type.parse::<ProfileType>()?;

        for (idx, doc) in self.documents.iter().enumerate() {
            if doc.mime_type.trim().is_empty() {
                return Err(AdvisorError::Validation(format!(
                    "document {} ('{}') has no MIME type",
                    idx + 1,
                    doc.display_name
                )));
            }
        }

        Ok(ValidatedRequest {
            jurisdiction,
            profile_type,
            tax_period: non_blank(self.tax_period.as_deref()),
            narrative_notes: non_blank(self.narrative_notes.as_deref()),
            documents: &self.documents,
            financials: self
                .structured_financials
                .as_ref()
                .filter(|f| !f.is_empty()),
            model_override: non_blank(self.model_override.as_deref()),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// An [`AnalysisRequest`] that passed validation, with strings trimmed and
/// blank optionals collapsed to `None`.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedRequest<'a> {
    pub jurisdiction: &'a str,
    pub profile_type: ProfileType,
    pub tax_period: Option<&'a str>,
    pub narrative_notes: Option<&'a str>,
    pub documents: &'a [Document],
    pub financials: Option<&'a StructuredFinancials>,
    pub model_override: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Response side
// ---------------------------------------------------------------------------

/// A type the generative model is asked to emit as JSON.
///
/// Deserialization is the first validation gate; `check` adds semantic rules
/// that a JSON schema cannot express.
pub trait StructuredOutput: DeserializeOwned + JsonSchema + Send {
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyFigure {
    #[schemars(description = "The name of the key figure (e.g., 'Total Income', 'Taxable Income').")]
    pub name: String,
    #[schemars(
        description = "The value as written, including currency symbols, ranges or units where relevant."
    )]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaxStrategy {
    #[schemars(description = "The title of the tax-saving strategy.")]
    pub title: String,
    #[schemars(description = "A detailed explanation of the strategy and its benefits.")]
    pub description: String,
    #[schemars(description = "A clear, actionable next step for the client.")]
    pub action: String,
    #[schemars(description = "The applicable section of the tax code or law.")]
    pub relevant_section: String,
    #[schemars(
        description = "Estimated potential savings as a human-readable amount or range in local currency (e.g., \"$2,000 - $3,000\" or \"₹50,000 - ₹75,000\")."
    )]
    pub potential_savings: String,
}

/// The structured tax report. Field order is the order the model generates them
/// in, which puts the executive summary last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[schemars(
        description = "One classification per recognized input document (e.g., 'US Form 1040', 'Profit and Loss Statement'). Empty when no documents were provided."
    )]
    pub document_types: Vec<String>,

    #[schemars(
        description = "Key financial figures consolidated from the structured data and any documents."
    )]
    pub key_figures: Vec<KeyFigure>,

    #[schemars(
        description = "A narrative summary of the client's overall financial health: strengths, weaknesses, trends and areas of concern."
    )]
    pub financial_health_summary: String,

    #[schemars(description = "Recommended tax-saving strategies.")]
    pub strategies: Vec<TaxStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(
        description = "A dedicated section answering the client's notes, questions or what-if scenarios. Omit when the client supplied no notes."
    )]
    pub what_if_analysis: Option<String>,

    #[schemars(
        description = "A brief, high-level summary of the findings and the total potential savings, written after all other sections."
    )]
    pub executive_summary: String,
}

impl StructuredOutput for AnalysisResult {
    fn check(&self) -> std::result::Result<(), String> {
        if self.financial_health_summary.trim().is_empty() {
            return Err("`financialHealthSummary` must be a non-empty string".to_string());
        }
        if self.executive_summary.trim().is_empty() {
            return Err("`executiveSummary` must be a non-empty string".to_string());
        }
        Ok(())
    }
}

/// Generates a Gemini-compatible response schema for `T`: all `$ref`s inlined,
/// no `$schema`/`definitions`, nullable unions collapsed, and an explicit
/// `propertyOrdering` so generation follows field declaration order.
pub fn gemini_response_schema<T: JsonSchema>() -> Result<Value> {
    let root = schemars::schema_for!(T);
    let mut value = serde_json::to_value(root)?;
    let definitions = match value.as_object_mut() {
        Some(obj) => match obj.remove("definitions") {
            Some(Value::Object(defs)) => defs,
            _ => Map::new(),
        },
        None => Map::new(),
    };

    let mut expanding = Vec::new();
    Ok(clean_schema_node(value, &definitions, &mut expanding))
}

const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "definitions",
    "title",
    "additionalProperties",
    "default",
    "examples",
];

fn clean_schema_node(node: Value, defs: &Map<String, Value>, expanding: &mut Vec<String>) -> Value {
    match node {
        Value::Object(mut obj) => {
            if let Some(Value::String(reference)) = obj.remove("$ref") {
                let name = reference.trim_start_matches("#/definitions/").to_string();
                let resolved = match defs.get(&name) {
                    Some(def) if !expanding.contains(&name) => {
                        expanding.push(name);
                        let cleaned = clean_schema_node(def.clone(), defs, expanding);
                        expanding.pop();
                        cleaned
                    }
                    _ => serde_json::json!({ "type": "object" }),
                };
                return merge_siblings(resolved, obj, defs, expanding);
            }

            // schemars wraps described references as `allOf: [{ $ref }]`
            if let Some(Value::Array(mut parts)) = obj.remove("allOf") {
                if parts.len() == 1 {
                    let inner = clean_schema_node(parts.remove(0), defs, expanding);
                    return merge_siblings(inner, obj, defs, expanding);
                }
                obj.insert("allOf".to_string(), Value::Array(parts));
            }

            for key in UNSUPPORTED_SCHEMA_KEYS {
                obj.remove(*key);
            }

            if let Some(Value::Array(types)) = obj.get("type").cloned() {
                let concrete: Vec<Value> = types
                    .into_iter()
                    .filter(|t| t.as_str() != Some("null"))
                    .collect();
                if concrete.len() == 1 {
                    obj.insert("type".to_string(), concrete[0].clone());
                    obj.insert("nullable".to_string(), Value::Bool(true));
                }
            }

            let mut cleaned = Map::new();
            for (key, value) in obj {
                let value = match (key.as_str(), value) {
                    ("enum" | "required", value) => value,
                    // property names are data, not schema keywords
                    ("properties", Value::Object(props)) => Value::Object(
                        props
                            .into_iter()
                            .map(|(name, prop)| (name, clean_schema_node(prop, defs, expanding)))
                            .collect(),
                    ),
                    (_, value) => clean_schema_node(value, defs, expanding),
                };
                cleaned.insert(key, value);
            }

            if let Some(Value::Object(props)) = cleaned.get("properties") {
                let ordering: Vec<Value> =
                    props.keys().map(|k| Value::String(k.clone())).collect();
                cleaned.insert("propertyOrdering".to_string(), Value::Array(ordering));
            }

            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| clean_schema_node(item, defs, expanding))
                .collect(),
        ),
        other => other,
    }
}

fn merge_siblings(
    resolved: Value,
    siblings: Map<String, Value>,
    defs: &Map<String, Value>,
    expanding: &mut Vec<String>,
) -> Value {
    let siblings = clean_schema_node(Value::Object(siblings), defs, expanding);
    match (resolved, siblings) {
        (Value::Object(mut base), Value::Object(extra)) => {
            for (key, value) in extra {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (resolved, _) => resolved,
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            content: content.into(),
        }
    }
}

/// Ordered, append-only conversation. The last turn of a history passed to
/// the assistant is the user question being answered.
pub type ChatHistory = Vec<ChatTurn>;
