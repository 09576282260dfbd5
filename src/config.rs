//! Layered YAML configuration (§3, §6, §9): built-in defaults → config file →
//! environment variables → CLI flags, with legacy key aliases normalized by a
//! table-driven pure function before validation.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml_ng::Value;

use crate::error::{ErrorCode, PipelineError};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
    pub token: String,
    pub default_branch: String,
    pub auto_fix_label: String,
    pub skip_label: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            token: String::new(),
            default_branch: "main".to_string(),
            auto_fix_label: "auto-fix".to_string(),
            skip_label: "auto-fix-skip".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AsanaConfig {
    pub token: String,
    pub workspace_gid: String,
    pub project_gids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorktreeConfig {
    pub base_dir: String,
    pub max_concurrent: u32,
    pub auto_cleanup_minutes: u32,
    pub prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: ".auto-fix/worktrees".to_string(),
            max_concurrent: 3,
            auto_cleanup_minutes: 120,
            prefix: "autofix-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChecksConfig {
    pub test_command: String,
    pub type_check_command: String,
    pub lint_command: String,
    pub test_timeout_secs: u64,
    pub type_check_timeout_secs: u64,
    pub lint_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            test_command: "npm test".to_string(),
            type_check_command: "npm run typecheck".to_string(),
            lint_command: "npm run lint".to_string(),
            test_timeout_secs: 300,
            type_check_timeout_secs: 120,
            lint_timeout_secs: 60,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriageConfig {
    pub confidence_threshold: f64,
    pub needs_info_labels: Vec<String>,
    pub synced_tag: String,
    pub processed_section: String,
    pub batch_warn_threshold: u32,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            needs_info_labels: vec!["needs-info".to_string(), "triage".to_string()],
            synced_tag: "synced".to_string(),
            processed_section: "Processed".to_string(),
            batch_warn_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiConfig {
    /// Binary name of the CLI agent invoked for analysis/fix/triage prompts.
    pub binary: String,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoFixConfig {
    pub github: GithubConfig,
    pub asana: AsanaConfig,
    pub worktree: WorktreeConfig,
    pub checks: ChecksConfig,
    pub logging: LoggingConfig,
    pub triage: TriageConfig,
    pub ai: AiConfig,
    pub rate_limit: RateLimitConfig,
}

/// One legacy alias: a dotted source path mapped onto one or more dotted
/// destination paths. Table-driven per §9, so the map can be extended without
/// touching validation or the deserializer.
struct AliasRule {
    from: &'static str,
    to: &'static [&'static str],
}

const ALIASES: &[AliasRule] = &[
    AliasRule { from: "tokens.github", to: &["github.token"] },
    AliasRule { from: "tokens.asana", to: &["asana.token"] },
    AliasRule { from: "asana.workspaceId", to: &["asana.workspace_gid"] },
    AliasRule { from: "asana.projectId", to: &["asana.project_gids"] },
    AliasRule { from: "worktree.basePath", to: &["worktree.base_dir"] },
    AliasRule { from: "worktree.maxParallel", to: &["worktree.max_concurrent"] },
    AliasRule {
        from: "checks.timeout",
        to: &[
            "checks.test_timeout_secs",
            "checks.type_check_timeout_secs",
            "checks.lint_timeout_secs",
        ],
    },
];

fn dotted_get(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_mapping()?.get(Value::String(segment.to_string()))?;
    }
    Some(current.clone())
}

fn dotted_remove(root: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    remove_at(root, &segments);
}

fn remove_at(root: &mut Value, segments: &[&str]) {
    if segments.is_empty() {
        return;
    }
    let Some(mapping) = root.as_mapping_mut() else { return };
    if segments.len() == 1 {
        mapping.remove(Value::String(segments[0].to_string()));
        return;
    }
    if let Some(child) = mapping.get_mut(Value::String(segments[0].to_string())) {
        remove_at(child, &segments[1..]);
    }
}

fn dotted_set(root: &mut Value, path: &str, value: Value) {
    if !root.is_mapping() {
        *root = Value::Mapping(Default::default());
    }
    let segments: Vec<&str> = path.split('.').collect();
    set_at(root, &segments, value);
}

fn set_at(root: &mut Value, segments: &[&str], value: Value) {
    let mapping = root.as_mapping_mut().expect("caller ensures mapping");
    if segments.len() == 1 {
        mapping.insert(Value::String(segments[0].to_string()), value);
        return;
    }
    let key = Value::String(segments[0].to_string());
    if !matches!(mapping.get(&key), Some(Value::Mapping(_))) {
        mapping.insert(key.clone(), Value::Mapping(Default::default()));
    }
    let child = mapping.get_mut(&key).unwrap();
    set_at(child, &segments[1..], value);
}

/// Pure function applying the legacy alias table. Idempotent:
/// `normalize_config(normalize_config(x)) == normalize_config(x)` because a
/// rule is a no-op once its source path has been removed.
pub fn normalize_config(mut raw: Value) -> Value {
    for rule in ALIASES {
        let Some(value) = dotted_get(&raw, rule.from) else {
            continue;
        };
        dotted_remove(&mut raw, rule.from);
        if rule.to.len() == 1 {
            // `projectId` (scalar) normalizes into `project_gids` (array).
            let target_is_array = rule.to[0].ends_with("_gids");
            let value = if target_is_array && !matches!(value, Value::Sequence(_)) {
                Value::Sequence(vec![value])
            } else {
                value
            };
            dotted_set(&mut raw, rule.to[0], value);
        } else {
            for target in rule.to {
                dotted_set(&mut raw, target, value.clone());
            }
        }
    }
    raw
}

fn validate(config: &AutoFixConfig) -> Result<(), PipelineError> {
    let mut errors = Vec::new();

    if !(1..=10).contains(&config.worktree.max_concurrent) {
        errors.push("worktree.max_concurrent must be in [1, 10]".to_string());
    }
    if config.checks.max_retries > 10 {
        errors.push("checks.max_retries must be <= 10".to_string());
    }
    if !(0.0..=1.0).contains(&config.triage.confidence_threshold) {
        errors.push("triage.confidence_threshold must be in [0, 1]".to_string());
    }
    if config.github.default_branch.trim().is_empty() {
        errors.push("github.default_branch must not be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::new(
            ErrorCode::ConfigValidationError,
            errors.join("; "),
        ))
    }
}

/// Searches upward from `start` for `.auto-fix.yaml`, `.auto-fix.yml`,
/// `auto-fix.yaml`, or `auto-fix.yml` (first match wins, in that order).
pub fn discover_config_path(start: &Path) -> Option<PathBuf> {
    const NAMES: [&str; 4] = [".auto-fix.yaml", ".auto-fix.yml", "auto-fix.yaml", "auto-fix.yml"];
    let mut dir = Some(start.to_path_buf());
    while let Some(current) = dir {
        for name in NAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        dir = current.parent().map(|p| p.to_path_buf());
    }
    None
}

/// Environment-variable overrides applied after the config file, before CLI
/// flags. `AUTO_FIX_*` is the canonical prefix; the shorthand names are
/// accepted pass-throughs per §6.
fn apply_env_overrides(mut raw: Value, env_vars: &HashMap<String, String>) -> Value {
    let direct = [
        ("GITHUB_TOKEN", "github.token"),
        ("GITHUB_OWNER", "github.owner"),
        ("GITHUB_REPO", "github.repo"),
        ("ASANA_TOKEN", "asana.token"),
        ("AUTO_FIX_GITHUB_TOKEN", "github.token"),
        ("AUTO_FIX_GITHUB_OWNER", "github.owner"),
        ("AUTO_FIX_GITHUB_REPO", "github.repo"),
        ("AUTO_FIX_ASANA_TOKEN", "asana.token"),
        ("AUTO_FIX_ASANA_WORKSPACE_GID", "asana.workspace_gid"),
        ("AUTO_FIX_BASE_BRANCH", "github.default_branch"),
        ("AUTO_FIX_LOG_LEVEL", "logging.level"),
    ];
    for (var, path) in direct {
        if let Some(value) = env_vars.get(var) {
            dotted_set(&mut raw, path, Value::String(value.clone()));
        }
    }
    raw
}

fn env_snapshot() -> HashMap<String, String> {
    env::vars().collect()
}

/// Loads and merges configuration: defaults → file (if any) → env → the
/// caller applies CLI overrides afterward (highest precedence, §6).
pub fn load_config(
    explicit_path: Option<&Path>,
    search_start: &Path,
) -> Result<AutoFixConfig, PipelineError> {
    let resolved_path = explicit_path
        .map(|p| p.to_path_buf())
        .or_else(|| env::var("AUTO_FIX_CONFIG").ok().map(PathBuf::from))
        .or_else(|| discover_config_path(search_start));

    let raw = match &resolved_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                PipelineError::new(
                    ErrorCode::ConfigMissing,
                    format!("failed to read {}: {e}", path.display()),
                )
            })?;
            serde_yaml_ng::from_str::<Value>(&contents)?
        }
        None => Value::Mapping(Default::default()),
    };

    let normalized = normalize_config(raw);
    // Idempotence (§8): normalizing twice must be a no-op.
    debug_assert_eq!(normalize_config(normalized.clone()), normalized);

    let with_env = apply_env_overrides(normalized, &env_snapshot());

    let config: AutoFixConfig = serde_yaml_ng::from_value(with_env)?;
    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml_ng::from_str(s).unwrap()
    }

    #[test]
    fn normalize_maps_legacy_token_aliases() {
        let raw = yaml("tokens:\n  github: abc\n  asana: def\n");
        let normalized = normalize_config(raw);
        assert_eq!(
            dotted_get(&normalized, "github.token"),
            Some(Value::String("abc".to_string()))
        );
        assert_eq!(
            dotted_get(&normalized, "asana.token"),
            Some(Value::String("def".to_string()))
        );
        assert!(dotted_get(&normalized, "tokens.github").is_none());
    }

    #[test]
    fn normalize_fans_out_checks_timeout() {
        let raw = yaml("checks:\n  timeout: 90\n");
        let normalized = normalize_config(raw);
        assert_eq!(
            dotted_get(&normalized, "checks.test_timeout_secs"),
            Some(Value::Number(90.into()))
        );
        assert_eq!(
            dotted_get(&normalized, "checks.lint_timeout_secs"),
            Some(Value::Number(90.into()))
        );
    }

    #[test]
    fn normalize_wraps_scalar_project_id_into_array() {
        let raw = yaml("asana:\n  projectId: \"123\"\n");
        let normalized = normalize_config(raw);
        let gids = dotted_get(&normalized, "asana.project_gids").unwrap();
        assert_eq!(gids, Value::Sequence(vec![Value::String("123".to_string())]));
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = yaml("tokens:\n  github: abc\nworktree:\n  maxParallel: 4\n");
        let once = normalize_config(raw);
        let twice = normalize_config(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn validate_rejects_out_of_range_concurrency() {
        let mut config = AutoFixConfig::default();
        config.worktree.max_concurrent = 0;
        assert!(validate(&config).is_err());
        config.worktree.max_concurrent = 11;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&AutoFixConfig::default()).is_ok());
    }
}
