use crate::error::{AdvisorError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ANALYSIS_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";

/// Runtime settings shared by the analyzer and the report assistant.
///
/// Credentials are not part of this struct; they belong to the
/// [`GenerativeModel`](crate::generation::GenerativeModel) backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub analysis_model: String,
    pub chat_model: String,
    /// Upper bound for a single remote generation call.
    pub request_timeout_secs: u64,
    /// Extra attempts allowed when the model output fails schema validation.
    pub malformed_output_retries: usize,
    /// Default for [`ChatOptions::allow_external_lookup`](crate::assistant::ChatOptions).
    pub allow_external_lookup: bool,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            analysis_model: DEFAULT_ANALYSIS_MODEL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            request_timeout_secs: 120,
            malformed_output_retries: 2,
            allow_external_lookup: true,
        }
    }
}

impl AdvisorConfig {
    /// Defaults overlaid with `TAX_ADVISOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(model) = lookup("TAX_ADVISOR_ANALYSIS_MODEL").filter(|v| !v.trim().is_empty()) {
            config.analysis_model = model.trim().to_string();
        }
        if let Some(model) = lookup("TAX_ADVISOR_CHAT_MODEL").filter(|v| !v.trim().is_empty()) {
            config.chat_model = model.trim().to_string();
        }
        if let Some(raw) = lookup("TAX_ADVISOR_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_var("TAX_ADVISOR_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("TAX_ADVISOR_MALFORMED_RETRIES") {
            config.malformed_output_retries = parse_var("TAX_ADVISOR_MALFORMED_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("TAX_ADVISOR_ALLOW_LOOKUP") {
            config.allow_external_lookup = parse_var("TAX_ADVISOR_ALLOW_LOOKUP", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_analysis_model(mut self, model: impl Into<String>) -> Self {
        self.analysis_model = model.into();
        self
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_malformed_output_retries(mut self, retries: usize) -> Self {
        self.malformed_output_retries = retries;
        self
    }

    pub fn with_external_lookup(mut self, allow: bool) -> Self {
        self.allow_external_lookup = allow;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis_model.trim().is_empty() || self.chat_model.trim().is_empty() {
            return Err(AdvisorError::Validation(
                "model identifiers must not be empty".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(AdvisorError::Validation(
                "request timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| AdvisorError::Validation(format!("{} has an invalid value '{}'", key, raw)))
}
