use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdvisorError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Generative model unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Generative model rejected the request: {0}")]
    RemoteRejected(String),

    #[error("Model output does not match the expected schema: {0}")]
    MalformedModelOutput(String),

    #[error("Invalid chat state: {0}")]
    InvalidChatState(String),

    #[error("Report not found: {0}")]
    ReportNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`AdvisorError`], used by callers deciding on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    RemoteUnavailable,
    RemoteRejected,
    MalformedModelOutput,
    InvalidChatState,
    ReportNotFound,
    Serialization,
    Io,
}

impl AdvisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdvisorError::Validation(_) => ErrorKind::Validation,
            AdvisorError::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            AdvisorError::RemoteRejected(_) => ErrorKind::RemoteRejected,
            AdvisorError::MalformedModelOutput(_) => ErrorKind::MalformedModelOutput,
            AdvisorError::InvalidChatState(_) => ErrorKind::InvalidChatState,
            AdvisorError::ReportNotFound(_) => ErrorKind::ReportNotFound,
            AdvisorError::Serialization(_) => ErrorKind::Serialization,
            AdvisorError::Io(_) => ErrorKind::Io,
        }
    }

    /// Only transient transport failures are safe to retry with unchanged input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdvisorError::RemoteUnavailable(_))
    }
}

#[cfg(feature = "gemini")]
impl From<reqwest::Error> for AdvisorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdvisorError::MalformedModelOutput(format!("Undecodable response body: {}", err))
        } else {
            AdvisorError::RemoteUnavailable(err.to_string())
        }
    }
}

impl From<json_patch::PatchError> for AdvisorError {
    fn from(err: json_patch::PatchError) -> Self {
        AdvisorError::MalformedModelOutput(format!("Repair patch could not be applied: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AdvisorError>;
