//! End-to-end config loading against the real filesystem: legacy alias
//! normalization, upward directory search, and validation, all exercised
//! through `load_config` rather than the lower-level helpers `config.rs`
//! already unit-tests in isolation.

use auto_fix_orchestrator::config::load_config;

fn write(dir: &std::path::Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).expect("write fixture config");
}

#[test]
fn load_config_with_no_file_falls_back_to_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let config = load_config(None, tmp.path()).expect("defaults must validate");
    assert_eq!(config.github.default_branch, "main");
    assert_eq!(config.worktree.max_concurrent, 3);
}

#[test]
fn load_config_reads_explicit_path_and_normalizes_legacy_aliases() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("legacy.yaml");
    write(
        tmp.path(),
        "legacy.yaml",
        "tokens:\n  github: gh-secret\n  asana: asana-secret\nasana:\n  workspaceId: \"99\"\n  projectId: \"123\"\n\
         worktree:\n  basePath: custom/worktrees\n",
    );

    let config = load_config(Some(&path), tmp.path()).expect("legacy config must normalize and validate");
    assert_eq!(config.github.token, "gh-secret");
    assert_eq!(config.asana.token, "asana-secret");
    assert_eq!(config.asana.workspace_gid, "99");
    assert_eq!(config.asana.project_gids, vec!["123".to_string()]);
    assert_eq!(config.worktree.base_dir, "custom/worktrees");
}

#[test]
fn load_config_discovers_dotfile_upward_from_a_nested_directory() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), ".auto-fix.yaml", "github:\n  default_branch: develop\n");
    let nested = tmp.path().join("a").join("b");
    std::fs::create_dir_all(&nested).unwrap();

    let config = load_config(None, &nested).expect("upward search must find the dotfile");
    assert_eq!(config.github.default_branch, "develop");
}

#[test]
fn load_config_rejects_invalid_values_at_validation_time() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("bad.yaml");
    write(tmp.path(), "bad.yaml", "worktree:\n  max_concurrent: 99\n");
    assert!(load_config(Some(&path), tmp.path()).is_err());
}
