use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Transient,
    Validation,
    NotFound,
}

/// Error body returned by the hosted backend on a rejected call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Column named by the backend in `details`/`hint`, when it names one.
    pub fn field(&self) -> Option<String> {
        [self.details.as_deref(), self.hint.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|text| text.strip_prefix("field:"))
            .map(|field| field.trim().to_string())
    }
}

/// Failure reported by a `DataSource` or `HierarchySource`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("backend unavailable: {0}")]
    TransientFetch(String),
    #[error("validation failed{}: {message}", field.as_deref().map(|f| format!(" for {f}")).unwrap_or_default())]
    Validation {
        field: Option<String>,
        message: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFetch(message.into())
    }

    pub fn validation(field: Option<&str>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SourceError::TransientFetch(_) => ErrorCode::Transient,
            SourceError::Validation { .. } => ErrorCode::Validation,
            SourceError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::TransientFetch(_))
    }
}
