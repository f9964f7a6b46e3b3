use crate::compiler::CompileError;
use crate::datasource::{DatasourceError, DatasourceRef};
use crate::spec::SpecError;

/// Errors surfaced per query in a chart-data payload.
///
/// Cache backend failures never appear here: they are logged and read as misses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChartDataError {
    #[error("Invalid query: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("Failed to compile query: {message}")]
    Compile { message: String, sql: Option<String> },

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Query timed out after {0} seconds")]
    Timeout(u64),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Datasource {0} not found")]
    DatasourceNotFound(DatasourceRef),
}

impl ChartDataError {
    /// Stable error kind reported to callers
    pub fn error_type(&self) -> &'static str {
        match self {
            ChartDataError::InvalidSpec(_) => "INVALID_SPEC_ERROR",
            ChartDataError::Compile { .. } => "COMPILE_ERROR",
            ChartDataError::Execution(_) => "EXECUTION_ERROR",
            ChartDataError::Timeout(_) => "TIMEOUT_ERROR",
            ChartDataError::Cancelled => "CANCELLED_ERROR",
            ChartDataError::DatasourceNotFound(_) => "DATASOURCE_NOT_FOUND_ERROR",
        }
    }

    /// SQL text attempted before the failure, when known
    pub fn sql(&self) -> Option<&str> {
        match self {
            ChartDataError::Compile { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

impl From<CompileError> for ChartDataError {
    fn from(e: CompileError) -> Self {
        ChartDataError::Compile {
            message: e.message,
            sql: e.sql,
        }
    }
}

impl From<DatasourceError> for ChartDataError {
    fn from(e: DatasourceError) -> Self {
        ChartDataError::Execution(e.to_string())
    }
}
