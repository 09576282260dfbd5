//! Asana project-tracker client (§6): task fetch/update/tag/comment
//! operations behind a narrow trait, cached through `TrackerCaches` so
//! triage's repeated per-task lookups don't hammer the API within the TTL
//! window (§5).

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::cache::TrackerCaches;
use crate::error::{ErrorCode, PipelineError};
use crate::ratelimit::RateLimiter;
use crate::types::ProjectTask;

const API_BASE: &str = "https://app.asana.com/api/1.0";

pub trait ProjectTracker: Send + Sync {
    fn list_tasks(
        &self,
        project_gid: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ProjectTask>, PipelineError>> + Send;

    fn fetch_task(
        &self,
        task_gid: &str,
    ) -> impl std::future::Future<Output = Result<ProjectTask, PipelineError>> + Send;

    fn fetch_subtasks(
        &self,
        task_gid: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ProjectTask>, PipelineError>> + Send;

    fn update_task(
        &self,
        task_gid: &str,
        notes: Option<&str>,
        completed: Option<bool>,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    fn add_tag(
        &self,
        task_gid: &str,
        tag_gid: &str,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    fn remove_tag(
        &self,
        task_gid: &str,
        tag_gid: &str,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    fn add_to_section(
        &self,
        task_gid: &str,
        section_gid: &str,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    fn create_comment(
        &self,
        task_gid: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), PipelineError>> + Send;

    fn workspace_tags(
        &self,
        workspace_gid: &str,
    ) -> impl std::future::Future<Output = Result<Vec<(String, String)>, PipelineError>> + Send;
}

pub struct AsanaClient {
    http: Client,
    token: String,
    caches: TrackerCaches,
    limiter: RateLimiter,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct RawTask {
    gid: String,
    name: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    tags: Vec<RawTag>,
    #[serde(default)]
    memberships: Vec<RawMembership>,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    permalink_url: String,
}

#[derive(Deserialize)]
struct RawTag {
    name: String,
}

#[derive(Deserialize)]
struct RawMembership {
    section: Option<RawSection>,
}

#[derive(Deserialize)]
struct RawSection {
    gid: String,
}

impl From<RawTask> for ProjectTask {
    fn from(raw: RawTask) -> Self {
        let section_gid = raw
            .memberships
            .into_iter()
            .find_map(|m| m.section.map(|s| s.gid));
        ProjectTask {
            gid: raw.gid,
            name: raw.name,
            notes: raw.notes,
            tags: raw.tags.into_iter().map(|t| t.name).collect(),
            section_gid,
            completed: raw.completed,
            permalink_url: raw.permalink_url,
        }
    }
}

impl AsanaClient {
    pub fn new(token: String) -> Self {
        Self::with_rate_limiter(token, RateLimiter::new(&crate::config::RateLimitConfig::default()))
    }

    pub fn with_rate_limiter(token: String, limiter: RateLimiter) -> Self {
        Self {
            http: Client::new(),
            token,
            caches: TrackerCaches::new(),
            limiter,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{API_BASE}{path}"))
            .bearer_auth(&self.token)
    }

    async fn map_error(response: reqwest::Response) -> PipelineError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS;
        let code = ErrorCode::classify_http(status.as_u16(), &body, rate_limited);
        PipelineError::new(code, format!("Asana API returned {status}: {body}"))
    }
}

impl ProjectTracker for AsanaClient {
    async fn list_tasks(&self, project_gid: &str) -> Result<Vec<ProjectTask>, PipelineError> {
        self.limiter.acquire().await;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/projects/{project_gid}/tasks?opt_fields=name,notes,tags.name,memberships.section,completed,permalink_url"
                ),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        let envelope: Envelope<Vec<RawTask>> = response.json().await?;
        let tasks: Vec<ProjectTask> = envelope.data.into_iter().map(ProjectTask::from).collect();
        for task in &tasks {
            self.caches.tasks.put(task.gid.clone(), task.clone());
        }
        Ok(tasks)
    }

    async fn fetch_task(&self, task_gid: &str) -> Result<ProjectTask, PipelineError> {
        if let Some(cached) = self.caches.tasks.get(task_gid) {
            return Ok(cached);
        }
        self.limiter.acquire().await;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/tasks/{task_gid}?opt_fields=name,notes,tags.name,memberships.section,completed,permalink_url"),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        let envelope: Envelope<RawTask> = response.json().await?;
        let task = ProjectTask::from(envelope.data);
        self.caches.tasks.put(task.gid.clone(), task.clone());
        Ok(task)
    }

    async fn fetch_subtasks(&self, task_gid: &str) -> Result<Vec<ProjectTask>, PipelineError> {
        self.limiter.acquire().await;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/tasks/{task_gid}/subtasks?opt_fields=name,notes,tags.name,completed,permalink_url"),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        let envelope: Envelope<Vec<RawTask>> = response.json().await?;
        Ok(envelope.data.into_iter().map(ProjectTask::from).collect())
    }

    async fn update_task(
        &self,
        task_gid: &str,
        notes: Option<&str>,
        completed: Option<bool>,
    ) -> Result<(), PipelineError> {
        let mut fields = serde_json::Map::new();
        if let Some(notes) = notes {
            fields.insert("notes".to_string(), json!(notes));
        }
        if let Some(completed) = completed {
            fields.insert("completed".to_string(), json!(completed));
        }
        self.limiter.acquire().await;
        let response = self
            .request(reqwest::Method::PUT, &format!("/tasks/{task_gid}"))
            .json(&json!({ "data": fields }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        self.caches.tasks.invalidate(task_gid);
        Ok(())
    }

    async fn add_tag(&self, task_gid: &str, tag_gid: &str) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        let response = self
            .request(reqwest::Method::POST, &format!("/tasks/{task_gid}/addTag"))
            .json(&json!({ "data": { "tag": tag_gid } }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        self.caches.tasks.invalidate(task_gid);
        Ok(())
    }

    async fn remove_tag(&self, task_gid: &str, tag_gid: &str) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        let response = self
            .request(reqwest::Method::POST, &format!("/tasks/{task_gid}/removeTag"))
            .json(&json!({ "data": { "tag": tag_gid } }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        self.caches.tasks.invalidate(task_gid);
        Ok(())
    }

    async fn add_to_section(&self, task_gid: &str, section_gid: &str) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        let response = self
            .request(reqwest::Method::POST, &format!("/sections/{section_gid}/addTask"))
            .json(&json!({ "data": { "task": task_gid } }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        self.caches.tasks.invalidate(task_gid);
        Ok(())
    }

    async fn create_comment(&self, task_gid: &str, text: &str) -> Result<(), PipelineError> {
        self.limiter.acquire().await;
        let response = self
            .request(reqwest::Method::POST, &format!("/tasks/{task_gid}/stories"))
            .json(&json!({ "data": { "text": text } }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        Ok(())
    }

    async fn workspace_tags(&self, workspace_gid: &str) -> Result<Vec<(String, String)>, PipelineError> {
        #[derive(Deserialize)]
        struct RawWorkspaceTag {
            gid: String,
            name: String,
        }
        self.limiter.acquire().await;
        let response = self
            .request(reqwest::Method::GET, &format!("/workspaces/{workspace_gid}/tags"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::map_error(response).await);
        }
        let envelope: Envelope<Vec<RawWorkspaceTag>> = response.json().await?;
        Ok(envelope.data.into_iter().map(|t| (t.gid, t.name)).collect())
    }
}
