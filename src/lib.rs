//! # Tax Strategy Advisor
//!
//! A library that turns financial documents and structured financial hints into
//! a schema-constrained tax analysis produced by a generative model, and answers
//! follow-up questions grounded in that report.
//!
//! ## Core Concepts
//!
//! - **Analysis**: [`TaxAnalyzer::analyze`] validates an [`AnalysisRequest`], builds
//!   a prompt, and returns an [`AnalysisResult`] that conforms to a fixed JSON schema.
//! - **Report chat**: [`ReportAssistant::chat`] answers the last user turn of a
//!   [`ChatHistory`] from the report, optionally with a disclosed web search.
//! - **Generation client**: [`GenerationClient`] wraps any [`GenerativeModel`]
//!   backend with a timeout, output validation and bounded repair retries.
//!   The `gemini` feature provides [`llm::GeminiClient`].
//! - **Errors**: every failure is a typed [`AdvisorError`]; nothing is silently
//!   defaulted.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tax_strategy_advisor::*;
//!
//! let backend = Arc::new(llm::GeminiClient::from_env()?);
//! let config = AdvisorConfig::from_env()?;
//! let analyzer = TaxAnalyzer::new(backend.clone(), &config);
//!
//! let mut financials = StructuredFinancials::default();
//! financials.income_and_investments.employment_income = Some("80000".into());
//!
//! let request = AnalysisRequest::new("United States", ProfileType::Individual)
//!     .with_financials(financials)
//!     .with_notes("What if I contribute $5000 more to retirement?");
//! let report = analyzer.analyze(&request).await?;
//!
//! let assistant = ReportAssistant::new(backend, &config);
//! let mut session = ChatSession::new(&assistant, &report, ChatOptions::from(&config));
//! let reply = session.ask("What is strategy 1?").await?;
//! ```

pub mod analyzer;
pub mod assistant;
pub mod config;
pub mod error;
pub mod generation;
pub mod ingestion;
pub mod prompts;
pub mod schema;
pub mod store;
pub mod utils;

#[cfg(feature = "gemini")]
pub mod llm;

pub use analyzer::TaxAnalyzer;
pub use assistant::{ChatOptions, ChatSession, ReportAssistant};
pub use config::AdvisorConfig;
pub use error::{AdvisorError, ErrorKind, Result};
pub use generation::{
    GenerationClient, GenerationRequest, GenerativeModel, Message, MessagePart, ToolGrant,
};
pub use ingestion::{load_document, load_documents, Document, DocumentSource};
pub use prompts::{build_analysis_prompt, build_chat_grounding, PromptPlan};
pub use schema::*;
pub use store::{InMemoryReportStore, JsonFileReportStore, Report, ReportInputs, ReportStore};
