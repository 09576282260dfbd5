//! GitHub issue-tracker and PR-host client (§6): the reference
//! implementation of the version-control host REST interface, behind a
//! narrow trait so the orchestrator and triage processor depend on
//! `IssueTracker`/`PullRequestHost`, not on `octocrab` directly.

use octocrab::models::issues::Issue as OctoIssue;
use octocrab::params::State as OctoState;
use octocrab::Octocrab;

use crate::error::{ErrorCode, PipelineError};
use crate::issue_parser::parse_issue_body;
use crate::ratelimit::RateLimiter;
use crate::types::{Issue, IssueContext, IssueState, IssueType, PullRequestRef};

#[derive(Debug, Clone)]
pub struct NewIssue<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewPullRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
    pub draft: bool,
}

/// Narrow issue-tracker trait the triage processor and grouping pipeline
/// depend on.
pub trait IssueTracker: Send + Sync {
    fn fetch_open_issues(
        &self,
        label: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<Issue>, PipelineError>> + Send;

    fn create_issue(
        &self,
        issue: NewIssue<'_>,
    ) -> impl std::future::Future<Output = Result<Issue, PipelineError>> + Send;

    fn add_labels(
        &self,
        issue_number: u64,
        labels: &[String],
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    fn remove_label(
        &self,
        issue_number: u64,
        label: &str,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    fn add_comment(
        &self,
        issue_number: u64,
        body: &str,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;
}

/// Narrow PR-host trait, separated from `IssueTracker` since a project could
/// in principle pair a non-GitHub issue tracker with a GitHub PR host.
pub trait PullRequestHost: Send + Sync {
    fn create_pull_request(
        &self,
        pr: NewPullRequest<'_>,
    ) -> impl std::future::Future<Output = Result<PullRequestRef, PipelineError>> + Send;

    fn find_pull_request_by_head(
        &self,
        head: &str,
    ) -> impl std::future::Future<Output = Result<Option<PullRequestRef>, PipelineError>> + Send;

    fn request_reviewers(
        &self,
        pr_number: u64,
        reviewers: &[String],
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;
}

pub struct GithubClient {
    client: Octocrab,
    owner: String,
    repo: String,
    limiter: RateLimiter,
}

impl GithubClient {
    pub fn new(token: String, owner: String, repo: String) -> Result<Self, PipelineError> {
        Self::with_rate_limiter(token, owner, repo, RateLimiter::new(&crate::config::RateLimitConfig::default()))
    }

    pub fn with_rate_limiter(
        token: String,
        owner: String,
        repo: String,
        limiter: RateLimiter,
    ) -> Result<Self, PipelineError> {
        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| PipelineError::new(ErrorCode::AuthFailed, format!("failed to build GitHub client: {e}")))?;
        Ok(Self { client, owner, repo, limiter })
    }
}

fn map_octocrab_error(e: octocrab::Error) -> PipelineError {
    PipelineError::from(e)
}

fn octo_issue_to_issue(octo: OctoIssue) -> Issue {
    let state = match octo.state {
        octocrab::models::IssueState::Open => IssueState::Open,
        _ => IssueState::Closed,
    };
    let labels: Vec<String> = octo.labels.into_iter().map(|l| l.name).collect();
    let issue_type = labels
        .iter()
        .find_map(|l| IssueType::parse(l))
        .unwrap_or(IssueType::Bug);
    let assignees = octo.assignees.into_iter().map(|a| a.login).collect();
    let body = octo.body.unwrap_or_default();
    let parsed = parse_issue_body(&body);

    let context = IssueContext {
        component: parsed.context.component.unwrap_or_default(),
        priority: parsed.context.priority,
        related_files: parsed.related_files.clone(),
        related_symbols: parsed.related_symbols,
        source: Some(crate::types::IssueSource::Github),
        source_id: Some(octo.number.to_string()),
        source_url: Some(octo.html_url.to_string()),
    };

    Issue {
        number: octo.number,
        title: octo.title,
        body,
        state,
        issue_type,
        labels,
        assignees,
        context,
        acceptance_criteria: parsed.acceptance_criteria,
        related_issues: Vec::new(),
        created_at: octo.created_at,
        updated_at: octo.updated_at,
        url: octo.html_url.to_string(),
    }
}

impl IssueTracker for GithubClient {
    async fn fetch_open_issues(&self, label: Option<&str>) -> Result<Vec<Issue>, PipelineError> {
        self.limiter.acquire().await;
        let mut builder = self
            .client
            .issues(&self.owner, &self.repo)
            .list()
            .state(OctoState::Open)
            .per_page(100);
        if let Some(label) = label {
            builder = builder.labels(&[label.to_string()]);
        }
        let page = builder.send().await.map_err(map_octocrab_error)?;
        Ok(page
            .items
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(octo_issue_to_issue)
            .collect())
    }

    async fn create_issue(&self, issue: NewIssue<'_>) -> Result<Issue, PipelineError> {
        self.limiter.acquire().await;
        let created = self
            .client
            .issues(&self.owner, &self.repo)
            .create(issue.title)
            .body(issue.body)
            .labels(issue.labels.clone())
            .assignees(issue.assignees.clone())
            .send()
            .await
            .map_err(map_octocrab_error)?;
        Ok(octo_issue_to_issue(created))
    }

    async fn add_labels(&self, issue_number: u64, labels: &[String]) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        self.client
            .issues(&self.owner, &self.repo)
            .add_labels(issue_number, labels)
            .await
            .map_err(map_octocrab_error)?;
        Ok(())
    }

    async fn remove_label(&self, issue_number: u64, label: &str) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        self.client
            .issues(&self.owner, &self.repo)
            .remove_label(issue_number, label)
            .await
            .map_err(map_octocrab_error)?;
        Ok(())
    }

    async fn add_comment(&self, issue_number: u64, body: &str) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        self.client
            .issues(&self.owner, &self.repo)
            .create_comment(issue_number, body)
            .await
            .map_err(map_octocrab_error)?;
        Ok(())
    }
}

impl PullRequestHost for GithubClient {
    async fn create_pull_request(&self, pr: NewPullRequest<'_>) -> Result<PullRequestRef, PipelineError> {
        self.limiter.acquire().await;
        let created = self
            .client
            .pulls(&self.owner, &self.repo)
            .create(pr.title, pr.head, pr.base)
            .body(pr.body)
            .draft(Some(pr.draft))
            .send()
            .await
            .map_err(map_octocrab_error)?;
        Ok(PullRequestRef {
            number: created.number,
            url: created.html_url.map(|u| u.to_string()).unwrap_or_default(),
            head: pr.head.to_string(),
            base: pr.base.to_string(),
            reused_existing: false,
        })
    }

    async fn find_pull_request_by_head(&self, head: &str) -> Result<Option<PullRequestRef>, PipelineError> {
        self.limiter.acquire().await;
        let head_filter = format!("{}:{}", self.owner, head);
        let page = self
            .client
            .pulls(&self.owner, &self.repo)
            .list()
            .head(&head_filter)
            .state(octocrab::params::State::All)
            .send()
            .await
            .map_err(map_octocrab_error)?;

        Ok(page.items.into_iter().next().map(|pr| PullRequestRef {
            number: pr.number,
            url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
            head: head.to_string(),
            base: pr.base.ref_field,
            reused_existing: true,
        }))
    }

    async fn request_reviewers(&self, pr_number: u64, reviewers: &[String]) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        self.client
            .pulls(&self.owner, &self.repo)
            .request_reviews(pr_number, reviewers.to_vec(), Vec::new())
            .await
            .map_err(map_octocrab_error)?;
        Ok(())
    }
}
