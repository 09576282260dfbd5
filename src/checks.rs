//! Check runner (§4.6): package-manager detection, ordered
//! typecheck/lint/test execution, per-check timeout, and the retry envelope
//! that feeds `previousErrors` back into the next AI fix attempt. Subprocess
//! supervision is the same process-group-isolated primitive `ai.rs` uses.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::ChecksConfig;
use crate::signals::{run_supervised, SubprocessError};
use crate::types::{CheckKind, CheckResult, CheckStatus, SingleCheckResult};
use crate::log_warn;

/// Order checks always run in, independent of how they're listed in config.
const CHECK_ORDER: [CheckKind; 3] = [CheckKind::Typecheck, CheckKind::Lint, CheckKind::Test];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    /// Detects the package manager in use by lockfile precedence:
    /// `pnpm-lock.yaml` > `yarn.lock` > `package-lock.json`, defaulting to npm.
    pub fn detect(workspace: &Path) -> Self {
        if workspace.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if workspace.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }

    fn run_command(&self, script: &str) -> String {
        match self {
            PackageManager::Npm if script == "test" => "npm test".to_string(),
            PackageManager::Npm => format!("npm run {script}"),
            PackageManager::Yarn => format!("yarn {script}"),
            PackageManager::Pnpm => format!("pnpm {script}"),
        }
    }
}

pub struct CheckRunner {
    config: ChecksConfig,
}

impl CheckRunner {
    pub fn new(config: ChecksConfig) -> Self {
        Self { config }
    }

    /// Resolves the shell command for one check kind. A configured command
    /// left at its default value is replaced by the detected package
    /// manager's equivalent; an explicitly customized command always wins.
    fn command_for(&self, kind: CheckKind, pm: PackageManager) -> String {
        let defaults = ChecksConfig::default();
        match kind {
            CheckKind::Typecheck => {
                if self.config.type_check_command == defaults.type_check_command {
                    pm.run_command("typecheck")
                } else {
                    self.config.type_check_command.clone()
                }
            }
            CheckKind::Lint => {
                if self.config.lint_command == defaults.lint_command {
                    pm.run_command("lint")
                } else {
                    self.config.lint_command.clone()
                }
            }
            CheckKind::Test => {
                if self.config.test_command == defaults.test_command {
                    pm.run_command("test")
                } else {
                    self.config.test_command.clone()
                }
            }
        }
    }

    fn timeout_for(&self, kind: CheckKind) -> Duration {
        let secs = match kind {
            CheckKind::Typecheck => self.config.type_check_timeout_secs,
            CheckKind::Lint => self.config.lint_timeout_secs,
            CheckKind::Test => self.config.test_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    /// Runs one check in `workspace`, with `CI=true` and color output
    /// disabled so tool output stays parseable.
    async fn run_one(&self, kind: CheckKind, workspace: &Path, pm: PackageManager) -> SingleCheckResult {
        let command = self.command_for(kind, pm);
        let started = Instant::now();

        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return SingleCheckResult {
                check: kind,
                passed: false,
                status: CheckStatus::Failed,
                stdout: None,
                stderr: None,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some("empty check command".to_string()),
            };
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts);
        cmd.current_dir(workspace);
        cmd.env("CI", "true");
        cmd.env("NO_COLOR", "1");
        cmd.env("FORCE_COLOR", "0");

        let timeout = self.timeout_for(kind);
        match run_supervised(cmd, timeout).await {
            Ok(outcome) => SingleCheckResult {
                check: kind,
                passed: outcome.status.success(),
                status: if outcome.status.success() { CheckStatus::Passed } else { CheckStatus::Failed },
                stdout: Some(outcome.stdout),
                stderr: Some(outcome.stderr),
                exit_code: outcome.status.code(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Err(SubprocessError::Timeout) => SingleCheckResult {
                check: kind,
                passed: false,
                status: CheckStatus::Timeout,
                stdout: None,
                stderr: None,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(format!("{} timed out after {}s", command, timeout.as_secs())),
            },
            Err(e) => {
                log_warn!("[checks] {} failed to run: {}", command, e);
                SingleCheckResult {
                    check: kind,
                    passed: false,
                    status: CheckStatus::Failed,
                    stdout: None,
                    stderr: None,
                    exit_code: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Runs typecheck, lint, and test in that fixed order, stopping at the
    /// first failure (later checks are skipped — their results would be
    /// meaningless against code that doesn't typecheck). `attempt` and
    /// `previous_errors` are threaded through from the orchestrator's retry
    /// state; this function does not retry on its own.
    pub async fn run_all(
        &self,
        workspace: &Path,
        attempt: u32,
        previous_errors: Vec<String>,
    ) -> CheckResult {
        let pm = PackageManager::detect(workspace);
        let started = Instant::now();
        let mut results = Vec::new();
        let mut passed = true;

        for &kind in CHECK_ORDER.iter() {
            let result = self.run_one(kind, workspace, pm).await;
            let ok = result.passed;
            results.push(result);
            if !ok {
                passed = false;
                break;
            }
        }

        let max_retries_exceeded = !passed && attempt >= self.config.max_retries;

        CheckResult {
            passed,
            results,
            attempt,
            max_retries_exceeded,
            previous_errors,
            total_duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Renders the failing check's stderr/stdout as a single error string the
/// AI collaborator's retry prompt can consume as `test_error`.
pub fn failure_summary(result: &CheckResult) -> Option<String> {
    result.results.iter().find(|r| !r.passed).map(|r| {
        let mut parts = Vec::new();
        if let Some(stderr) = &r.stderr {
            if !stderr.trim().is_empty() {
                parts.push(stderr.trim().to_string());
            }
        }
        if let Some(stdout) = &r.stdout {
            if !stdout.trim().is_empty() {
                parts.push(stdout.trim().to_string());
            }
        }
        if let Some(error) = &r.error {
            parts.push(error.clone());
        }
        format!("[{}] {}", r.check, parts.join("\n"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn detect_prefers_pnpm_over_yarn_and_npm() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Pnpm);
    }

    #[test]
    fn detect_falls_back_to_npm_without_lockfiles() {
        let dir = TempDir::new().unwrap();
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Npm);
    }

    #[test]
    fn command_for_uses_detected_manager_when_default_unchanged() {
        let runner = CheckRunner::new(ChecksConfig::default());
        assert_eq!(runner.command_for(CheckKind::Test, PackageManager::Yarn), "yarn test");
        assert_eq!(runner.command_for(CheckKind::Lint, PackageManager::Pnpm), "pnpm lint");
    }

    #[test]
    fn command_for_respects_explicit_override() {
        let mut config = ChecksConfig::default();
        config.test_command = "make test".to_string();
        let runner = CheckRunner::new(config);
        assert_eq!(runner.command_for(CheckKind::Test, PackageManager::Yarn), "make test");
    }

    #[tokio::test]
    async fn run_all_stops_at_first_failure() {
        let mut config = ChecksConfig::default();
        config.type_check_command = "false".to_string();
        config.lint_command = "true".to_string();
        config.test_command = "true".to_string();
        config.type_check_timeout_secs = 5;
        let runner = CheckRunner::new(config);
        let dir = TempDir::new().unwrap();

        let result = runner.run_all(dir.path(), 1, vec![]).await;
        assert!(!result.passed);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].check, CheckKind::Typecheck);
    }

    #[tokio::test]
    async fn run_all_runs_every_check_when_all_pass() {
        let mut config = ChecksConfig::default();
        config.type_check_command = "true".to_string();
        config.lint_command = "true".to_string();
        config.test_command = "true".to_string();
        let runner = CheckRunner::new(config);
        let dir = TempDir::new().unwrap();

        let result = runner.run_all(dir.path(), 1, vec![]).await;
        assert!(result.passed);
        assert_eq!(result.results.len(), 3);
    }
}
