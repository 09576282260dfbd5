//! AI collaborator invocation (§6): the same subprocess-invoked CLI agent
//! idiom this codebase already uses for its own AI CLI calls, generalized to
//! the three prompt kinds — analysis, fix (plus retry), and triage
//! classification — behind one narrow trait so the orchestrator and triage
//! processor depend on `AiCollaborator`, not a concrete subprocess.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::config::AiConfig;
use crate::error::{ErrorCode, PipelineError};
use crate::prompt::{
    build_analysis_prompt, build_fix_prompt, build_retry_fix_prompt, build_triage_prompt,
    TriagePromptParams,
};
use crate::signals::{run_supervised, SubprocessError};
use crate::types::{AnalysisRecord, FixAnalysis, FixResult, IssueGroup};
use crate::log_debug;

/// Narrow trait the orchestrator and triage processor depend on. `workspace`
/// is the directory the subprocess should run in; analysis/classify calls
/// pass the repository root since they have no workspace yet.
pub trait AiCollaborator: Send + Sync {
    fn analyze(
        &self,
        group: &IssueGroup,
        workspace: &Path,
    ) -> impl std::future::Future<Output = Result<FixAnalysis, PipelineError>> + Send;

    fn fix(
        &self,
        group: &IssueGroup,
        analysis: &FixAnalysis,
        workspace: &Path,
    ) -> impl std::future::Future<Output = Result<FixResult, PipelineError>> + Send;

    fn retry_fix(
        &self,
        group: &IssueGroup,
        analysis: &FixAnalysis,
        previous_summary: &str,
        test_error: &str,
        workspace: &Path,
    ) -> impl std::future::Future<Output = Result<FixResult, PipelineError>> + Send;

    fn classify(
        &self,
        params: &TriagePromptParams<'_>,
        workspace: &Path,
    ) -> impl std::future::Future<Output = Result<AnalysisRecord, PipelineError>> + Send;
}

/// Real implementation: invokes the configured CLI agent binary as a
/// process-group-supervised subprocess, prompt passed as a positional
/// argument the way this codebase's own AI CLI invocation does.
pub struct CliAiCollaborator {
    config: AiConfig,
}

impl CliAiCollaborator {
    pub fn new(config: AiConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, prompt: &str, workspace: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.binary);
        cmd.arg("-p").arg(prompt);
        if let Some(model) = &self.config.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(workspace);
        cmd
    }

    async fn invoke(&self, prompt: &str, workspace: &Path) -> Result<String, PipelineError> {
        let cmd = self.build_command(prompt, workspace);
        log_debug!("[ai] invoking {} in {}", self.config.binary, workspace.display());

        let outcome = run_supervised(cmd, Duration::from_secs(self.config.timeout_secs))
            .await
            .map_err(|e| match e {
                SubprocessError::Timeout => PipelineError::new(
                    ErrorCode::Timeout,
                    format!("AI collaborator timed out after {}s", self.config.timeout_secs),
                ),
                SubprocessError::ShutdownRequested => {
                    PipelineError::new(ErrorCode::Interrupted, "shutdown requested mid-invocation")
                }
                SubprocessError::Spawn(msg) => PipelineError::new(
                    ErrorCode::AiAnalysisFailed,
                    format!("failed to spawn AI collaborator: {msg}"),
                ),
                SubprocessError::Wait(msg) => {
                    PipelineError::new(ErrorCode::AiAnalysisFailed, format!("AI collaborator failed: {msg}"))
                }
            })?;

        if !outcome.status.success() {
            return Err(PipelineError::new(
                ErrorCode::AiAnalysisFailed,
                format!(
                    "AI collaborator exited with {:?}: {}",
                    outcome.status.code(),
                    outcome.stderr.trim()
                ),
            ));
        }

        Ok(outcome.stdout)
    }
}

impl AiCollaborator for CliAiCollaborator {
    async fn analyze(&self, group: &IssueGroup, workspace: &Path) -> Result<FixAnalysis, PipelineError> {
        let prompt = build_analysis_prompt(group);
        let output = self.invoke(&prompt, workspace).await?;
        parse_json_response(&output, ErrorCode::AiAnalysisFailed)
    }

    async fn fix(
        &self,
        group: &IssueGroup,
        analysis: &FixAnalysis,
        workspace: &Path,
    ) -> Result<FixResult, PipelineError> {
        let prompt = build_fix_prompt(
            group,
            &analysis.root_cause,
            &analysis.suggested_fix,
            &analysis.affected_files,
        );
        let output = self.invoke(&prompt, workspace).await?;
        parse_json_response(&output, ErrorCode::AiFixFailed)
    }

    async fn retry_fix(
        &self,
        group: &IssueGroup,
        analysis: &FixAnalysis,
        previous_summary: &str,
        test_error: &str,
        workspace: &Path,
    ) -> Result<FixResult, PipelineError> {
        let prompt = build_retry_fix_prompt(
            group,
            &analysis.root_cause,
            &analysis.suggested_fix,
            &analysis.affected_files,
            previous_summary,
            test_error,
        );
        let output = self.invoke(&prompt, workspace).await?;
        parse_json_response(&output, ErrorCode::AiFixFailed)
    }

    async fn classify(
        &self,
        params: &TriagePromptParams<'_>,
        workspace: &Path,
    ) -> Result<AnalysisRecord, PipelineError> {
        let prompt = build_triage_prompt(params);
        let output = self.invoke(&prompt, workspace).await?;
        parse_json_response(&output, ErrorCode::AiAnalysisFailed)
    }
}

/// Extracts the first balanced `{...}` object from `text` and deserializes
/// it. Collaborator output is often wrapped in prose or a markdown fence
/// despite the prompt's instructions, so this scans rather than assuming
/// `text` is bare JSON.
fn parse_json_response<T: DeserializeOwned>(text: &str, on_error: ErrorCode) -> Result<T, PipelineError> {
    let object = extract_json_object(text).ok_or_else(|| {
        PipelineError::new(on_error, "AI collaborator response contained no JSON object")
    })?;
    serde_json::from_str(&object).map_err(|e| {
        PipelineError::new(
            on_error,
            format!("AI collaborator response did not match the expected schema: {e}"),
        )
    })
}

fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Mock collaborator for pipeline tests: returns a fixed sequence of
/// results per method, consumed in call order.
pub struct MockAiCollaborator {
    analyze_results: tokio::sync::Mutex<Vec<Result<FixAnalysis, PipelineError>>>,
    fix_results: tokio::sync::Mutex<Vec<Result<FixResult, PipelineError>>>,
    classify_results: tokio::sync::Mutex<Vec<Result<AnalysisRecord, PipelineError>>>,
}

impl MockAiCollaborator {
    pub fn new() -> Self {
        Self {
            analyze_results: tokio::sync::Mutex::new(Vec::new()),
            fix_results: tokio::sync::Mutex::new(Vec::new()),
            classify_results: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_analyze_results(mut self, mut results: Vec<Result<FixAnalysis, PipelineError>>) -> Self {
        results.reverse();
        self.analyze_results = tokio::sync::Mutex::new(results);
        self
    }

    pub fn with_fix_results(mut self, mut results: Vec<Result<FixResult, PipelineError>>) -> Self {
        results.reverse();
        self.fix_results = tokio::sync::Mutex::new(results);
        self
    }

    pub fn with_classify_results(mut self, mut results: Vec<Result<AnalysisRecord, PipelineError>>) -> Self {
        results.reverse();
        self.classify_results = tokio::sync::Mutex::new(results);
        self
    }
}

impl Default for MockAiCollaborator {
    fn default() -> Self {
        Self::new()
    }
}

impl AiCollaborator for MockAiCollaborator {
    async fn analyze(&self, _group: &IssueGroup, _workspace: &Path) -> Result<FixAnalysis, PipelineError> {
        self.analyze_results
            .lock()
            .await
            .pop()
            .unwrap_or_else(|| Err(PipelineError::new(ErrorCode::AiAnalysisFailed, "no more mock results")))
    }

    async fn fix(
        &self,
        _group: &IssueGroup,
        _analysis: &FixAnalysis,
        _workspace: &Path,
    ) -> Result<FixResult, PipelineError> {
        self.fix_results
            .lock()
            .await
            .pop()
            .unwrap_or_else(|| Err(PipelineError::new(ErrorCode::AiFixFailed, "no more mock results")))
    }

    async fn retry_fix(
        &self,
        _group: &IssueGroup,
        _analysis: &FixAnalysis,
        _previous_summary: &str,
        _test_error: &str,
        _workspace: &Path,
    ) -> Result<FixResult, PipelineError> {
        self.fix_results
            .lock()
            .await
            .pop()
            .unwrap_or_else(|| Err(PipelineError::new(ErrorCode::AiFixFailed, "no more mock results")))
    }

    async fn classify(
        &self,
        _params: &TriagePromptParams<'_>,
        _workspace: &Path,
    ) -> Result<AnalysisRecord, PipelineError> {
        self.classify_results
            .lock()
            .await
            .pop()
            .unwrap_or_else(|| Err(PipelineError::new(ErrorCode::AiAnalysisFailed, "no more mock results")))
    }
}
