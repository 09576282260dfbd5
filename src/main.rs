//! CLI surface (§6): `autofix` drives the grouping → queue → orchestrator
//! pipeline against GitHub issues; `triage` drives Asana tasks through the
//! classifier into new GitHub issues. Global flags are accepted before the
//! subcommand, mirroring this codebase's existing `clap` layout.

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use auto_fix_orchestrator::ai::CliAiCollaborator;
use auto_fix_orchestrator::asana::AsanaClient;
use auto_fix_orchestrator::checks::CheckRunner;
use auto_fix_orchestrator::config::{self, AutoFixConfig};
use auto_fix_orchestrator::github::GithubClient;
use auto_fix_orchestrator::grouping::{group_issues, GroupingParams, LabelFilter};
use auto_fix_orchestrator::log::{self, parse_log_level, LogLevel};
use auto_fix_orchestrator::orchestrator::Deps;
use auto_fix_orchestrator::progress::ProgressReporter;
use auto_fix_orchestrator::ratelimit::RateLimiter;
use auto_fix_orchestrator::triage::{needs_batch_confirmation, TriageOutcome, TriageProcessor};
use auto_fix_orchestrator::types::{GroupBy, Priority, ProjectTask};
use auto_fix_orchestrator::worktree::WorktreeManager;
use auto_fix_orchestrator::{lock, queue, signals};
use auto_fix_orchestrator::{log_error, log_info, log_warn};

/// Sizes chosen for grouped-work ergonomics; not currently exposed as
/// configuration since no config surface names them.
const DEFAULT_MAX_GROUP_SIZE: usize = 3;
const DEFAULT_MIN_GROUP_SIZE: usize = 1;
const DEFAULT_MAX_BRANCH_LENGTH: usize = 200;
const DEFAULT_BRANCH_PREFIX: &str = "fix";

#[derive(Parser)]
#[command(
    name = "auto-fix",
    about = "Triages tracker tasks into issues and drives grouped AI fixes to pull requests"
)]
struct Cli {
    /// Path to the YAML config file (defaults to searching upward for .auto-fix.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Group open issues and drive each group through the auto-fix pipeline
    Autofix {
        /// Process every open issue carrying the auto-fix label
        #[arg(long)]
        all: bool,

        /// Process only these issue numbers (comma-separated)
        #[arg(long, value_delimiter = ',')]
        issues: Vec<u64>,

        #[arg(long, default_value = "component")]
        group_by: String,

        #[arg(long, default_value_t = 3)]
        max_parallel: u32,

        #[arg(long)]
        dry_run: bool,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        #[arg(long)]
        labels: Option<String>,

        #[arg(long)]
        exclude_labels: Option<String>,

        #[arg(long)]
        base_branch: Option<String>,

        #[arg(long)]
        verbose: bool,
    },
    /// Classify tracker tasks and file matching issues
    Triage {
        /// Asana project gid (defaults to the first configured project)
        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value = "batch")]
        mode: String,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        section: Option<String>,

        /// Override the AI classifier's priority for every issue this run files
        #[arg(long)]
        priority: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        /// Skip the confirmation prompt for batches over the warn threshold
        #[arg(long)]
        yes: bool,

        #[arg(long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = run(cli).await;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    if let Err(e) = signals::install_signal_handlers() {
        log_warn!("[main] failed to install signal handlers: {}", e);
    }

    let level = match parse_log_level(&cli.log_level) {
        Ok(level) => level,
        Err(e) => {
            log_error!("[main] {}", e);
            return 2;
        }
    };
    log::set_log_level(level);

    let project_root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            log_error!("[main] failed to read current directory: {}", e);
            return 2;
        }
    };

    let config = match config::load_config(cli.config.as_deref(), &project_root) {
        Ok(config) => config,
        Err(e) => {
            log_error!("[main] config error: {}", e);
            return 2;
        }
    };

    let runtime_dir = project_root.join(".auto-fix");
    let _lock_guard = match lock::try_acquire(&runtime_dir) {
        Ok(guard) => guard,
        Err(e) => {
            log_error!("[main] {}", e);
            return 2;
        }
    };

    match cli.command {
        Commands::Autofix {
            all,
            issues,
            group_by,
            max_parallel,
            dry_run,
            max_retries,
            labels,
            exclude_labels,
            base_branch,
            verbose,
        } => {
            if verbose {
                log::set_log_level(LogLevel::Debug);
            }
            if all && !issues.is_empty() {
                log_error!("[main] --all and --issues are mutually exclusive");
                return 2;
            }
            run_autofix(
                AutofixArgs {
                    all,
                    issues,
                    group_by,
                    max_parallel,
                    dry_run,
                    max_retries,
                    labels,
                    exclude_labels,
                    base_branch,
                },
                config,
                &project_root,
            )
            .await
        }
        Commands::Triage {
            project,
            mode,
            dry_run,
            section,
            priority,
            limit,
            yes,
            verbose,
        } => {
            if verbose {
                log::set_log_level(LogLevel::Debug);
            }
            run_triage(
                TriageArgs {
                    project,
                    mode,
                    dry_run,
                    section,
                    priority,
                    limit,
                    yes,
                },
                config,
                &project_root,
            )
            .await
        }
    }
}

struct AutofixArgs {
    all: bool,
    issues: Vec<u64>,
    group_by: String,
    max_parallel: u32,
    dry_run: bool,
    max_retries: u32,
    labels: Option<String>,
    exclude_labels: Option<String>,
    base_branch: Option<String>,
}

async fn run_autofix(args: AutofixArgs, config: AutoFixConfig, project_root: &Path) -> i32 {
    if config.github.owner.is_empty() || config.github.repo.is_empty() || config.github.token.is_empty() {
        log_error!("[autofix] github.owner, github.repo, and github.token must all be configured");
        return 2;
    }

    let limiter = RateLimiter::new(&config.rate_limit);
    let github = match GithubClient::with_rate_limiter(
        config.github.token.clone(),
        config.github.owner.clone(),
        config.github.repo.clone(),
        limiter,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log_error!("[autofix] failed to build GitHub client: {}", e);
            return 2;
        }
    };

    let label_filter = if args.all { None } else { Some(config.github.auto_fix_label.as_str()) };
    let all_issues = match github.fetch_open_issues(label_filter).await {
        Ok(issues) => issues,
        Err(e) => {
            log_error!("[autofix] failed to fetch issues: {}", e);
            return 2;
        }
    };

    let selected: Vec<_> = if args.issues.is_empty() {
        all_issues
    } else {
        let wanted: std::collections::HashSet<u64> = args.issues.iter().copied().collect();
        all_issues.into_iter().filter(|i| wanted.contains(&i.number)).collect()
    };

    if selected.is_empty() {
        log_info!("[autofix] no matching issues found, nothing to do");
        return 0;
    }

    let Some(group_by) = GroupBy::parse(&args.group_by) else {
        log_error!("[autofix] invalid --group-by value '{}'", args.group_by);
        return 2;
    };

    let params = GroupingParams {
        group_by,
        max_group_size: DEFAULT_MAX_GROUP_SIZE,
        min_group_size: DEFAULT_MIN_GROUP_SIZE,
        filter: LabelFilter::from_csv(args.labels.as_deref(), args.exclude_labels.as_deref()),
        branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        max_branch_length: DEFAULT_MAX_BRANCH_LENGTH,
    };

    let outcome = match group_issues(selected, &params) {
        Ok(outcome) => outcome,
        Err(e) => {
            log_error!("[autofix] grouping failed: {}", e);
            return 2;
        }
    };

    if !outcome.ungrouped.is_empty() {
        log_warn!("[autofix] {} issue(s) did not fit a group and were skipped", outcome.ungrouped.len());
    }
    if outcome.groups.is_empty() {
        log_info!("[autofix] no groups to process");
        return 0;
    }

    let worktree = Arc::new(WorktreeManager::new(
        project_root,
        project_root.join(&config.worktree.base_dir),
        config.worktree.prefix.clone(),
    ));
    let checks = Arc::new(CheckRunner::new(config.checks.clone()));
    let ai = Arc::new(CliAiCollaborator::new(config.ai.clone()));
    let default_branch = args.base_branch.unwrap_or_else(|| config.github.default_branch.clone());

    let deps: Deps<CliAiCollaborator, GithubClient, GithubClient> = Deps {
        ai,
        issue_tracker: github.clone(),
        pr_host: github,
        worktree,
        checks,
        progress: ProgressReporter::new(),
        default_branch,
        auto_fix_label: config.github.auto_fix_label.clone(),
        max_retries: args.max_retries,
        dry_run: args.dry_run,
    };

    log_info!(
        "[autofix] processing {} group(s) with max_parallel={}{}",
        outcome.groups.len(),
        args.max_parallel,
        if args.dry_run { " (dry run)" } else { "" }
    );

    let (summary, dry_run_log) =
        queue::run_all(outcome.groups, deps, args.max_parallel, CancellationToken::new()).await;

    if args.dry_run && !dry_run_log.is_empty() {
        println!("{}", dry_run_log.render_summary());
    }

    log_info!(
        "[autofix] completed: {} succeeded, {} failed, {} PR(s) opened, halt reason: {}",
        summary.groups_completed.len(),
        summary.groups_failed.len(),
        summary.prs_opened,
        summary.halt_reason
    );
    for failed in &summary.groups_failed {
        log_warn!("[autofix] group '{}' failed", failed);
    }

    summary.exit_code()
}

struct TriageArgs {
    project: Option<String>,
    mode: String,
    dry_run: bool,
    section: Option<String>,
    priority: Option<String>,
    limit: Option<usize>,
    yes: bool,
}

enum BatchChoice {
    Continue,
    FirstTwenty,
    Cancel,
}

fn confirm_batch(total: usize) -> BatchChoice {
    println!(
        "About to triage {total} tasks, which is above the warn threshold. \
         Continue with all (c), process the first 20 (f), or cancel (x)?"
    );
    print!("> ");
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        return BatchChoice::Cancel;
    }
    match line.trim().to_lowercase().as_str() {
        "c" | "continue" => BatchChoice::Continue,
        "f" | "first" | "first-20" => BatchChoice::FirstTwenty,
        _ => BatchChoice::Cancel,
    }
}

async fn run_triage(args: TriageArgs, config: AutoFixConfig, project_root: &Path) -> i32 {
    if config.github.owner.is_empty() || config.github.repo.is_empty() || config.github.token.is_empty() {
        log_error!("[triage] github.owner, github.repo, and github.token must all be configured");
        return 2;
    }
    if config.asana.token.is_empty() {
        log_error!("[triage] asana.token must be configured");
        return 2;
    }

    let project_gid = match args.project.clone().or_else(|| config.asana.project_gids.first().cloned()) {
        Some(gid) => gid,
        None => {
            log_error!("[triage] no Asana project gid given (--project or asana.project_gids)");
            return 2;
        }
    };

    let limiter = RateLimiter::new(&config.rate_limit);
    let github = match GithubClient::with_rate_limiter(
        config.github.token.clone(),
        config.github.owner.clone(),
        config.github.repo.clone(),
        limiter.clone(),
    ) {
        Ok(client) => client,
        Err(e) => {
            log_error!("[triage] failed to build GitHub client: {}", e);
            return 2;
        }
    };
    let asana = AsanaClient::with_rate_limiter(config.asana.token.clone(), limiter);

    let mut tasks: Vec<ProjectTask> = match asana.list_tasks(&project_gid).await {
        Ok(tasks) => tasks,
        Err(e) => {
            log_error!("[triage] failed to list tasks: {}", e);
            return 2;
        }
    };

    if let Some(section_gid) = &args.section {
        tasks.retain(|t| t.section_gid.as_deref() == Some(section_gid.as_str()));
    }
    if let Some(limit) = args.limit {
        tasks.truncate(limit);
    }

    if tasks.is_empty() {
        log_info!("[triage] no tasks to process");
        return 0;
    }

    let priority_override = match &args.priority {
        Some(value) => match Priority::parse(value) {
            Some(priority) => Some(priority),
            None => {
                log_error!("[triage] invalid --priority value '{}'", value);
                return 2;
            }
        },
        None => None,
    };

    if args.mode == "batch" && !args.yes && needs_batch_confirmation(&config.triage, tasks.len()) {
        match confirm_batch(tasks.len()) {
            BatchChoice::Continue => {}
            BatchChoice::FirstTwenty => tasks.truncate(config.triage.batch_warn_threshold as usize),
            BatchChoice::Cancel => {
                log_info!("[triage] cancelled by user");
                return 0;
            }
        }
    }

    let synced_tag_gid = match asana.workspace_tags(&config.asana.workspace_gid).await {
        Ok(tags) => tags
            .into_iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(&config.triage.synced_tag))
            .map(|(gid, _)| gid)
            .unwrap_or_else(|| config.triage.synced_tag.clone()),
        Err(e) => {
            log_warn!("[triage] failed to resolve synced tag gid, using configured value verbatim: {}", e);
            config.triage.synced_tag.clone()
        }
    };
    let processed_section_gid = args.section.clone().unwrap_or_else(|| config.triage.processed_section.clone());
    let available_labels = vec![
        "bug".to_string(),
        "feature".to_string(),
        "refactor".to_string(),
        "docs".to_string(),
        "test".to_string(),
        "chore".to_string(),
    ];

    let processor = TriageProcessor::with_priority_override(
        CliAiCollaborator::new(config.ai.clone()),
        github,
        asana,
        config.triage.clone(),
        available_labels,
        synced_tag_gid,
        processed_section_gid,
        priority_override,
    );

    let mut created = 0u32;
    let mut needs_info = 0u32;
    let mut skipped = 0u32;
    let mut failed = 0u32;

    for task in &tasks {
        if args.dry_run {
            log_info!("[triage] (dry run) would classify task {} ('{}')", task.gid, task.name);
            continue;
        }
        match processor.process_task(task, project_root).await {
            TriageOutcome::IssueCreated { task_gid, issue_number, .. } => {
                log_info!("[triage] task {} -> issue #{}", task_gid, issue_number);
                created += 1;
            }
            TriageOutcome::NeedsInfo { task_gid, issue_number, weak_fields, .. } => {
                log_info!(
                    "[triage] task {} -> needs-info issue #{} (missing: {})",
                    task_gid,
                    issue_number,
                    weak_fields.join(", ")
                );
                needs_info += 1;
            }
            TriageOutcome::Skipped { task_gid } => {
                log_info!("[triage] task {} already synced, skipping", task_gid);
                skipped += 1;
            }
            TriageOutcome::Failed { task_gid, error } => {
                log_warn!("[triage] task {} failed: {}", task_gid, error);
                failed += 1;
            }
        }
    }

    log_info!(
        "[triage] completed: {} created, {} needs-info, {} skipped, {} failed",
        created,
        needs_info,
        skipped,
        failed
    );

    if failed > 0 {
        1
    } else {
        0
    }
}
