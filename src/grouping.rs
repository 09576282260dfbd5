//! Grouping engine (§4.1): partitions issues by a chosen dimension while
//! honoring size bounds, and derives branch names. Pure and synchronous —
//! no I/O, no async — so it is exercised directly by unit tests, the same
//! way this codebase keeps its scheduling/transition logic I/O-free.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;

use crate::error::{ErrorCode, PipelineError};
use crate::issue_parser::parse_issue_body;
use crate::types::{GroupBy, Issue, IssueGroup, Priority};

/// Label include/exclude filter, parsed from `--labels`/`--exclude-labels`.
#[derive(Debug, Clone, Default)]
pub struct LabelFilter {
    pub include: HashSet<String>,
    pub exclude: HashSet<String>,
}

impl LabelFilter {
    pub fn from_csv(include: Option<&str>, exclude: Option<&str>) -> Self {
        Self {
            include: csv_to_set(include),
            exclude: csv_to_set(exclude),
        }
    }

    fn matches(&self, issue: &Issue) -> bool {
        let labels: HashSet<String> = issue.labels.iter().map(|l| l.to_lowercase()).collect();
        let included = self.include.is_empty() || labels.iter().any(|l| self.include.contains(l));
        let excluded = !self.exclude.is_empty() && labels.iter().any(|l| self.exclude.contains(l));
        included && !excluded
    }
}

fn csv_to_set(csv: Option<&str>) -> HashSet<String> {
    csv.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct GroupingParams {
    pub group_by: GroupBy,
    pub max_group_size: usize,
    pub min_group_size: usize,
    pub filter: LabelFilter,
    pub branch_prefix: String,
    pub max_branch_length: usize,
}

impl GroupingParams {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.max_group_size == 0 || self.min_group_size == 0 {
            return Err(PipelineError::new(
                ErrorCode::InvalidParams,
                "maxGroupSize and minGroupSize must be >= 1",
            ));
        }
        if self.min_group_size > self.max_group_size {
            return Err(PipelineError::new(
                ErrorCode::InvalidGroupSize,
                format!(
                    "minGroupSize ({}) > maxGroupSize ({})",
                    self.min_group_size, self.max_group_size
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupingOutcome {
    pub groups: Vec<IssueGroup>,
    /// Issues that were filtered out, or landed in a bucket/remainder smaller
    /// than `minGroupSize`.
    pub ungrouped: Vec<Issue>,
}

/// Runs the grouping algorithm described in §4.1, steps 1-6.
pub fn group_issues(
    issues: Vec<Issue>,
    params: &GroupingParams,
) -> Result<GroupingOutcome, PipelineError> {
    if issues.is_empty() {
        return Err(PipelineError::new(ErrorCode::EmptyIssues, "no issues to group"));
    }
    params.validate()?;

    let (kept, mut ungrouped): (Vec<Issue>, Vec<Issue>) = issues
        .into_iter()
        .partition(|issue| params.filter.matches(issue));

    // Step 2: bucket by key. BTreeMap for deterministic iteration order.
    let mut buckets: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
    for issue in kept {
        let key = derive_key(&issue, params.group_by);
        buckets.entry(key).or_default().push(issue);
    }

    // Step 3: drop undersized buckets into ungrouped.
    let mut sized_buckets: Vec<(String, Vec<Issue>)> = Vec::new();
    for (key, issues) in buckets {
        if issues.len() < params.min_group_size {
            ungrouped.extend(issues);
        } else {
            sized_buckets.push((key, issues));
        }
    }

    // Step 4: split oversized buckets into chunks; fold a too-small last
    // chunk's members into ungrouped.
    let mut chunked: Vec<(String, Vec<Vec<Issue>>)> = Vec::new();
    for (key, mut issues) in sized_buckets {
        issues.sort_by_key(|i| i.number);
        if issues.len() <= params.max_group_size {
            chunked.push((key, vec![issues]));
            continue;
        }
        let mut chunks: Vec<Vec<Issue>> = issues
            .chunks(params.max_group_size)
            .map(|c| c.to_vec())
            .collect();
        if let Some(last) = chunks.last() {
            if last.len() < params.min_group_size {
                let overflow = chunks.pop().unwrap();
                ungrouped.extend(overflow);
            }
        }
        if !chunks.is_empty() {
            chunked.push((key, chunks));
        }
    }

    // Step 5 + 6: build IssueGroup values with unique branch names.
    let mut used_branch_names: HashSet<String> = HashSet::new();
    let mut groups = Vec::new();
    for (key, chunks) in chunked {
        let multi_part = chunks.len() > 1;
        for (idx, chunk_issues) in chunks.into_iter().enumerate() {
            let components = union_components(&chunk_issues);
            let related_files = union_related_files(&chunk_issues);
            let priority = Priority::max_of(chunk_issues.iter().map(|i| i.priority()));
            let mut numbers: Vec<u64> = chunk_issues.iter().map(|i| i.number).collect();
            numbers.sort_unstable();

            let mut branch_name = build_branch_name(
                &params.branch_prefix,
                &key,
                &numbers,
                params.max_branch_length,
            );
            if multi_part {
                branch_name = format!("{branch_name}-part{}", idx + 1);
            }
            // §4.1: "All branch names emitted in a single run are unique."
            let mut candidate = branch_name.clone();
            let mut suffix = 2;
            while used_branch_names.contains(&candidate) {
                candidate = format!("{branch_name}-{suffix}");
                suffix += 1;
            }
            used_branch_names.insert(candidate.clone());

            let id = format!("{}-{}", params.group_by, key);
            let id = if multi_part {
                format!("{id}-part{}", idx + 1)
            } else {
                id
            };

            groups.push(IssueGroup {
                id,
                name: key.clone(),
                group_by: params.group_by,
                key: key.clone(),
                issues: chunk_issues,
                branch_name: candidate,
                related_files,
                components,
                priority,
            });
        }
    }

    Ok(GroupingOutcome { groups, ungrouped })
}

fn union_components(issues: &[Issue]) -> Vec<String> {
    let mut set: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for issue in issues {
        if !issue.context.component.is_empty() {
            set.insert(issue.context.component.clone());
        }
    }
    set.into_iter().collect()
}

fn union_related_files(issues: &[Issue]) -> Vec<String> {
    let mut set: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for issue in issues {
        set.extend(issue.context.related_files.iter().cloned());
    }
    set.into_iter().collect()
}

/// Derives the bucket key for one issue under the chosen dimension (§4.1 step 2).
fn derive_key(issue: &Issue, group_by: GroupBy) -> String {
    match group_by {
        GroupBy::Component => derive_component_key(issue),
        GroupBy::File => derive_file_key(issue),
        GroupBy::Label => issue
            .labels
            .first()
            .cloned()
            .unwrap_or_else(|| "uncategorized".to_string()),
        GroupBy::Type => issue.issue_type.to_string(),
        GroupBy::Priority => issue.priority().to_string(),
    }
}

fn derive_component_key(issue: &Issue) -> String {
    if !issue.context.component.is_empty() {
        return issue.context.component.clone();
    }
    for label in &issue.labels {
        if let Some(rest) = label.strip_prefix("component:") {
            return rest.to_string();
        }
        if let Some(rest) = label.strip_prefix("area/") {
            return rest.to_string();
        }
    }
    if let Some(first_file) = issue.context.related_files.first() {
        if let Some(component) = heuristic_component_from_path(first_file) {
            return component;
        }
    }
    if let Some(component) = parse_component_from_body(&issue.body) {
        return component;
    }
    "uncategorized".to_string()
}

fn heuristic_component_from_path(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('/').collect();
    for pair in segments.windows(2) {
        if (pair[0] == "components" || pair[0] == "features") && !pair[1].is_empty() {
            return Some(pair[1].to_string());
        }
    }
    let known_roots = ["utils", "lib"];
    if let Some(first) = segments.first() {
        if known_roots.contains(first) {
            return Some((*first).to_string());
        }
    }
    None
}

fn parse_component_from_body(body: &str) -> Option<String> {
    let re = Regex::new(r"(?im)^\s*(?:Component|Service)\s*:\s*(.+)$").ok()?;
    re.captures(body)
        .map(|c| c.get(1).unwrap().as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Bucket key for the `file` dimension: the first distinct path in
/// `relatedFiles ∪ codeAnalysis.filePath ∪ paths extracted from the body`
/// (§4.1). `context.related_files` already covers the first two sources;
/// the body is re-parsed here so issues whose file paths only ever appear
/// in a `## Code Analysis`/`## Files`/`## Related Files` section (and were
/// never folded into `context.related_files` upstream) still bucket
/// correctly instead of falling to `uncategorized`.
fn derive_file_key(issue: &Issue) -> String {
    issue
        .context
        .related_files
        .iter()
        .cloned()
        .chain(parse_issue_body(&issue.body).related_files)
        .next()
        .unwrap_or_else(|| "uncategorized".to_string())
}

/// Branch name per §4.1 step 6: `{prefix}/{identifier}/issue-{n1}-{n2}-...`,
/// sanitized and length-truncated by shortening the middle.
fn build_branch_name(prefix: &str, identifier: &str, numbers: &[u64], max_length: usize) -> String {
    let sanitized = sanitize_identifier(identifier);
    let numbers_suffix = numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join("-");
    let full = format!("{prefix}/{sanitized}/issue-{numbers_suffix}");
    if full.len() <= max_length {
        return full;
    }

    // Preserve prefix and numbers suffix; shorten the identifier in the middle.
    let fixed = format!("{prefix}//issue-{numbers_suffix}");
    let budget = max_length.saturating_sub(fixed.len());
    if budget == 0 {
        return fixed.replacen("//", "/", 1);
    }
    let half = budget / 2;
    let shortened = if sanitized.len() > budget {
        let head: String = sanitized.chars().take(half).collect();
        let tail: String = sanitized
            .chars()
            .rev()
            .take(budget - half)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{head}-{tail}")
    } else {
        sanitized
    };
    format!("{prefix}/{shortened}/issue-{numbers_suffix}")
}

/// Lowercase, replace disallowed characters with `-`, collapse runs, trim.
fn sanitize_identifier(identifier: &str) -> String {
    let lowered = identifier.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}
