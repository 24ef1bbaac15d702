//! Stable error taxonomy shared by the tool executor, the agent loop, and the HTTP layer.
//!
//! Every variant carries the stable `code` surfaced to the client and (as a structured
//! tool result) back to the LLM, so it can attempt a correction. See spec §7.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum AppError {
    BadSpec { field_path: String, reason: String },
    BadPlot { reason: String },
    ColumnNotFound { column: String },
    DatasetNotFound { dataset_id: String },
    UnknownTool { tool_name: String },
    BadToolArgs { reason: String },
    QueryFailed { message: String },
    QueryTimeout,
    LlmError { message: String },
    LlmRateLimited,
    BudgetExhausted { reason: String },
    Cancelled,
}

impl AppError {
    pub fn bad_spec(field_path: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::BadSpec { field_path: field_path.into(), reason: reason.into() }
    }

    pub fn bad_plot(reason: impl Into<String>) -> Self {
        AppError::BadPlot { reason: reason.into() }
    }

    /// Stable identifier from spec §7, used both in `TraceStep.error_code` and as the
    /// HTTP body's `error_code` field.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadSpec { .. } => "BAD_SPEC",
            AppError::BadPlot { .. } => "BAD_PLOT",
            AppError::ColumnNotFound { .. } => "COLUMN_NOT_FOUND",
            AppError::DatasetNotFound { .. } => "DATASET_NOT_FOUND",
            AppError::UnknownTool { .. } => "UNKNOWN_TOOL",
            AppError::BadToolArgs { .. } => "BAD_TOOL_ARGS",
            AppError::QueryFailed { .. } => "QUERY_FAILED",
            AppError::QueryTimeout => "QUERY_TIMEOUT",
            AppError::LlmError { .. } => "LLM_ERROR",
            AppError::LlmRateLimited => "LLM_RATE_LIMITED",
            AppError::BudgetExhausted { .. } => "BUDGET_EXHAUSTED",
            AppError::Cancelled => "CANCELLED",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AppError::BadSpec { field_path, reason } => format!("{field_path}: {reason}"),
            AppError::BadPlot { reason } => reason.clone(),
            AppError::ColumnNotFound { column } => format!("column not found: {column}"),
            AppError::DatasetNotFound { dataset_id } => format!("dataset not found: {dataset_id}"),
            AppError::UnknownTool { tool_name } => format!("unknown tool: {tool_name}"),
            AppError::BadToolArgs { reason } => reason.clone(),
            AppError::QueryFailed { message } => message.clone(),
            AppError::QueryTimeout => "query exceeded its time budget".to_string(),
            AppError::LlmError { message } => message.clone(),
            AppError::LlmRateLimited => "the LLM provider rate-limited this request".to_string(),
            AppError::BudgetExhausted { reason } => reason.clone(),
            AppError::Cancelled => "the request was cancelled".to_string(),
        }
    }

    /// Is this error one the agent loop may hand back to the LLM as a structured tool
    /// result for self-correction, or must it terminate the request? See spec §4.G.
    pub fn is_recoverable_by_llm(&self) -> bool {
        matches!(
            self,
            AppError::BadSpec { .. } | AppError::BadPlot { .. } | AppError::QueryFailed { .. }
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AppError::BadSpec { .. }
            | AppError::BadPlot { .. }
            | AppError::BadToolArgs { .. } => 400,
            AppError::DatasetNotFound { .. } | AppError::ColumnNotFound { .. } => 404,
            AppError::UnknownTool { .. } => 400,
            AppError::QueryFailed { .. } => 422,
            AppError::QueryTimeout => 504,
            AppError::LlmRateLimited => 429,
            AppError::LlmError { .. } => 502,
            AppError::BudgetExhausted { .. } => 504,
            AppError::Cancelled => 499,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<duckdb::Error> for AppError {
    fn from(err: duckdb::Error) -> Self {
        AppError::QueryFailed { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::bad_spec("limit", "too large").http_status(), 400);
        assert_eq!(
            AppError::DatasetNotFound { dataset_id: "x".into() }.http_status(),
            404
        );
        assert_eq!(AppError::QueryTimeout.http_status(), 504);
        assert_eq!(AppError::LlmRateLimited.http_status(), 429);
        assert_eq!(AppError::BudgetExhausted { reason: "steps".into() }.http_status(), 504);
    }

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(AppError::bad_spec("a", "b").code(), "BAD_SPEC");
        assert_eq!(AppError::bad_plot("x").code(), "BAD_PLOT");
        assert_eq!(AppError::QueryTimeout.code(), "QUERY_TIMEOUT");
        assert_eq!(AppError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn recoverable_classification() {
        assert!(AppError::bad_spec("a", "b").is_recoverable_by_llm());
        assert!(AppError::QueryFailed { message: "x".into() }.is_recoverable_by_llm());
        assert!(!AppError::DatasetNotFound { dataset_id: "x".into() }.is_recoverable_by_llm());
        assert!(!AppError::UnknownTool { tool_name: "x".into() }.is_recoverable_by_llm());
    }
}
