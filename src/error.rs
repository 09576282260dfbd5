//! Typed error vocabulary (§7). One enum, `ErrorCode`, for machine matching
//! (HTTP-status classification, retry gating); `PipelineError` wraps a code
//! with a machine message, optional structured context, and the underlying
//! cause where one exists.

use std::fmt;

use serde_json::Value;

/// Machine-matchable error code. Grouped the way §7 groups them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Configuration
    ConfigMissing,
    ConfigInvalid,
    ConfigValidationError,
    EnvOverrideError,

    // External APIs
    AuthFailed,
    RateLimited,
    ApiError,
    NotFound,
    NetworkError,
    ValidationFailed,
    AlreadyExists,

    // Workspace
    WorktreeCreateFailed,
    WorktreeCleanupFailed,
    BranchExists,
    WorktreeError,

    // Pipeline
    AiAnalysisFailed,
    AiFixFailed,
    CheckFailed,
    LintFailed,
    TestFailed,
    TypecheckFailed,
    PrCreateFailed,
    IssueUpdateFailed,
    PipelineFailed,
    Interrupted,
    Timeout,
    UnknownError,

    // Grouping (§4.1 failure modes)
    EmptyIssues,
    InvalidParams,
    InvalidGroupSize,
    GroupingFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConfigMissing => "CONFIG_MISSING",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::ConfigValidationError => "CONFIG_VALIDATION_ERROR",
            ErrorCode::EnvOverrideError => "ENV_OVERRIDE_ERROR",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::WorktreeCreateFailed => "WORKTREE_CREATE_FAILED",
            ErrorCode::WorktreeCleanupFailed => "WORKTREE_CLEANUP_FAILED",
            ErrorCode::BranchExists => "BRANCH_EXISTS",
            ErrorCode::WorktreeError => "WORKTREE_ERROR",
            ErrorCode::AiAnalysisFailed => "AI_ANALYSIS_FAILED",
            ErrorCode::AiFixFailed => "AI_FIX_FAILED",
            ErrorCode::CheckFailed => "CHECK_FAILED",
            ErrorCode::LintFailed => "LINT_FAILED",
            ErrorCode::TestFailed => "TEST_FAILED",
            ErrorCode::TypecheckFailed => "TYPECHECK_FAILED",
            ErrorCode::PrCreateFailed => "PR_CREATE_FAILED",
            ErrorCode::IssueUpdateFailed => "ISSUE_UPDATE_FAILED",
            ErrorCode::PipelineFailed => "PIPELINE_FAILED",
            ErrorCode::Interrupted => "INTERRUPTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::EmptyIssues => "EMPTY_ISSUES",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::InvalidGroupSize => "INVALID_GROUP_SIZE",
            ErrorCode::GroupingFailed => "GROUPING_FAILED",
        }
    }

    /// Whether this code is retried with backoff by default, absent an
    /// explicit per-error `recoverable` override.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::ApiError
                | ErrorCode::NetworkError
                | ErrorCode::Timeout
                | ErrorCode::CheckFailed
                | ErrorCode::LintFailed
                | ErrorCode::TestFailed
                | ErrorCode::TypecheckFailed
                | ErrorCode::WorktreeCreateFailed
                | ErrorCode::AiAnalysisFailed
                | ErrorCode::AiFixFailed
        )
    }

    /// Whether this code halts the pipeline immediately, never retried.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed
                | ErrorCode::NotFound
                | ErrorCode::BranchExists
                | ErrorCode::ValidationFailed
                | ErrorCode::AlreadyExists
                | ErrorCode::ConfigMissing
                | ErrorCode::ConfigInvalid
                | ErrorCode::ConfigValidationError
                | ErrorCode::EnvOverrideError
                | ErrorCode::EmptyIssues
                | ErrorCode::InvalidParams
                | ErrorCode::InvalidGroupSize
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single error surfaced by any subsystem, carrying enough structure for
/// both the retry classifier and the final user-facing report.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct PipelineError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
    /// Explicit override of the code's default retryable classification,
    /// e.g. a rate-limit response carrying a reset time in the past.
    pub recoverable: Option<bool>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PipelineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            recoverable: None,
            source: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = Some(recoverable);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.recoverable.unwrap_or_else(|| self.code.is_retryable())
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && self.code.is_fatal()
    }

    /// Derived user-facing message, distinct from the machine `message`.
    pub fn user_message(&self) -> String {
        match self.code {
            ErrorCode::AuthFailed => {
                "Authentication failed — check the configured API token.".to_string()
            }
            ErrorCode::RateLimited => {
                "The remote API is rate-limiting requests; retrying with backoff.".to_string()
            }
            ErrorCode::NotFound => "The requested resource could not be found.".to_string(),
            ErrorCode::BranchExists => {
                "A branch with this name already exists; choose a different group or clean it up."
                    .to_string()
            }
            ErrorCode::WorktreeCreateFailed => {
                "Could not create an isolated workspace for this group.".to_string()
            }
            ErrorCode::CheckFailed | ErrorCode::LintFailed | ErrorCode::TestFailed
            | ErrorCode::TypecheckFailed => {
                "Verification checks failed after the configured retries.".to_string()
            }
            ErrorCode::PrCreateFailed => "Could not open a pull request.".to_string(),
            ErrorCode::Interrupted => "Run was interrupted.".to_string(),
            ErrorCode::Timeout => "Operation timed out.".to_string(),
            _ => self.message.clone(),
        }
    }

    /// A short suggested remediation, where one is known.
    pub fn suggested_action(&self) -> Option<&'static str> {
        match self.code {
            ErrorCode::AuthFailed => Some("verify the configured token has not expired"),
            ErrorCode::BranchExists => Some("delete the stale branch or rerun with a new group"),
            ErrorCode::ConfigMissing => Some("run with --config pointing at a valid config file"),
            ErrorCode::RateLimited => Some("wait for the rate limit window to reset"),
            _ => None,
        }
    }

    /// Classifies an HTTP response into a code, per §6/§8: 401→AUTH,
    /// 403-with-rate-limit→RATE_LIMIT else AUTH, 404→NOT_FOUND,
    /// 422→VALIDATION or ALREADY_EXISTS (by message substring),
    /// network errors→NETWORK_ERROR, others→UNKNOWN.
    pub fn classify_http(status: u16, message: &str, rate_limited: bool) -> ErrorCode {
        match status {
            401 => ErrorCode::AuthFailed,
            403 if rate_limited => ErrorCode::RateLimited,
            403 => ErrorCode::AuthFailed,
            404 => ErrorCode::NotFound,
            422 => {
                if message.to_lowercase().contains("already exists") {
                    ErrorCode::AlreadyExists
                } else {
                    ErrorCode::ValidationFailed
                }
            }
            429 => ErrorCode::RateLimited,
            500..=599 => ErrorCode::ApiError,
            _ => ErrorCode::UnknownError,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::new(ErrorCode::UnknownError, err.to_string()).with_source(err)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::Timeout
        } else if err.is_connect() {
            ErrorCode::NetworkError
        } else if let Some(status) = err.status() {
            PipelineError::classify_http(status.as_u16(), &err.to_string(), false)
        } else {
            ErrorCode::UnknownError
        };
        PipelineError::new(code, err.to_string()).with_source(err)
    }
}

impl From<octocrab::Error> for PipelineError {
    fn from(err: octocrab::Error) -> Self {
        let code = match &err {
            octocrab::Error::GitHub { source, .. } => {
                PipelineError::classify_http(source.status_code.as_u16(), &source.message, false)
            }
            octocrab::Error::Http { source, .. } if source.is_timeout() => ErrorCode::Timeout,
            octocrab::Error::Http { .. } => ErrorCode::NetworkError,
            _ => ErrorCode::ApiError,
        };
        PipelineError::new(code, err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for PipelineError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        PipelineError::new(ErrorCode::ConfigInvalid, err.to_string()).with_source(err)
    }
}
