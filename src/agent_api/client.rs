//! Typed client over the agent-server HTTP API.

use std::collections::HashMap;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::types::{
    CreateSessionRequest, CreateSessionResponse, CreateWorktreeRequest, PromptRequest,
    SessionActivity, Worktree, WorktreeDirectory,
};
use crate::config::PermissionRule;
use crate::{AppError, Result};

/// Client bound to one agent server and one working directory.
#[derive(Debug, Clone)]
pub struct AgentApiClient {
    http: reqwest::Client,
    base_url: String,
    directory: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdleEvent {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
}

impl AgentApiClient {
    /// Client for `base_url` (e.g. `http://127.0.0.1:4096`).
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            directory: None,
            password: None,
            timeout,
        }
    }

    /// Scope every request to `directory`.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Authenticate with HTTP basic auth (empty user name).
    #[must_use]
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    /// Server base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|err| AppError::Http(format!("invalid url {}{path}: {err}", self.base_url)))?;
        if let Some(ref dir) = self.directory {
            url.query_pairs_mut().append_pair("directory", dir);
        }
        Ok(url)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let mut builder = self.http.request(method, self.url(path)?);
        if let Some(ref password) = self.password {
            builder = builder.basic_auth("", Some(password));
        }
        Ok(builder)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(builder: RequestBuilder) -> Result<T> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Http(format!("agent server returned {status}: {body}")));
        }
        Ok(resp.json::<T>().await?)
    }

    async fn send_empty(builder: RequestBuilder) -> Result<()> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Http(format!("agent server returned {status}: {body}")));
        }
        Ok(())
    }

    /// `GET /global/health` with `timeout`; any failure reads as unhealthy.
    pub async fn health(&self, timeout: Duration) -> bool {
        let Ok(builder) = self.request(Method::GET, "/global/health") else {
            return false;
        };
        matches!(
            builder.timeout(timeout).send().await,
            Ok(resp) if resp.status() == reqwest::StatusCode::OK
        )
    }

    /// Create a session with `ruleset` and return its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure and `AppError::Session`
    /// if the response carries no id.
    pub async fn create_session(&self, ruleset: &[PermissionRule]) -> Result<String> {
        let builder = self
            .request(Method::POST, "/session")?
            .timeout(self.timeout)
            .json(&CreateSessionRequest {
                permission: ruleset,
            });
        let resp: CreateSessionResponse = Self::send_json(builder).await?;
        if resp.id.is_empty() {
            return Err(AppError::Session("session create response has no id".into()));
        }
        info!(agent_session_id = %resp.id, "agent session created");
        Ok(resp.id)
    }

    /// Send a prompt and wait for the agent's reply.
    ///
    /// Waits indefinitely unless `timeout` is given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let mut builder = self
            .request(Method::POST, &format!("/session/{session_id}/message"))?
            .json(&PromptRequest::text(prompt));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self::send_json(builder).await
    }

    /// Queue a prompt and return immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn send_prompt_async(&self, session_id: &str, prompt: &str) -> Result<()> {
        let builder = self
            .request(Method::POST, &format!("/session/{session_id}/prompt_async"))?
            .timeout(self.timeout)
            .json(&PromptRequest::text(prompt));
        Self::send_empty(builder).await
    }

    /// Activity of `session_id`. Errors read as [`SessionActivity::Unknown`].
    pub async fn session_status(&self, session_id: &str) -> SessionActivity {
        let fetched: Result<HashMap<String, StatusEntry>> = async {
            let builder = self
                .request(Method::GET, "/session/status")?
                .timeout(self.timeout);
            Self::send_json(builder).await
        }
        .await;

        match fetched {
            Ok(map) => map
                .get(session_id)
                .and_then(|entry| entry.kind.as_deref())
                .map_or(SessionActivity::Idle, SessionActivity::parse),
            Err(err) => {
                warn!(%err, session_id, "session status poll failed");
                SessionActivity::Unknown
            }
        }
    }

    /// Number of messages in `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn message_count(&self, session_id: &str) -> Result<usize> {
        let builder = self
            .request(Method::GET, &format!("/session/{session_id}/message"))?
            .timeout(self.timeout);
        let messages: Vec<serde_json::Value> = Self::send_json(builder).await?;
        Ok(messages.len())
    }

    /// Watch `/event` until `session.idle` for `session_id` arrives.
    ///
    /// Returns `Ok(false)` if the stream ends or `timeout` elapses first.
    /// `timeout` covers opening the stream too; opening is additionally
    /// bounded by the client's request timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` if the stream cannot be opened.
    pub async fn wait_for_idle(&self, session_id: &str, timeout: Option<Duration>) -> Result<bool> {
        let wait = async {
            let resp = self.open_event_stream().await?;
            Ok::<_, AppError>(watch_for_idle(resp, session_id).await)
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(Ok(false)),
            None => wait.await,
        }
    }

    async fn open_event_stream(&self) -> Result<reqwest::Response> {
        let send = self
            .request(Method::GET, "/event")?
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send();
        let resp = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| {
                AppError::Http(format!(
                    "event stream did not open within {}s",
                    self.timeout.as_secs_f32()
                ))
            })??;
        if !resp.status().is_success() {
            return Err(AppError::Http(format!(
                "event stream returned {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    /// Abort processing in `session_id` with `timeout`. Never fails.
    pub async fn abort(&self, session_id: &str, timeout: Duration) -> bool {
        let result = async {
            let builder = self
                .request(Method::POST, &format!("/session/{session_id}/abort"))?
                .timeout(timeout)
                .json(&serde_json::json!({}));
            Self::send_empty(builder).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(session_id, "agent session aborted");
                true
            }
            Err(err) => {
                warn!(session_id, %err, "agent session abort failed");
                false
            }
        }
    }

    /// Create a worktree.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn create_worktree(
        &self,
        name: Option<&str>,
        start_command: Option<&str>,
    ) -> Result<Worktree> {
        let builder = self
            .request(Method::POST, "/experimental/worktree")?
            .timeout(self.timeout)
            .json(&CreateWorktreeRequest {
                name,
                start_command,
            });
        let worktree: Worktree = Self::send_json(builder).await?;
        info!(name = %worktree.name, directory = %worktree.directory, "worktree created");
        Ok(worktree)
    }

    /// Worktree directories of the project.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn list_worktrees(&self) -> Result<Vec<String>> {
        let builder = self
            .request(Method::GET, "/experimental/worktree")?
            .timeout(self.timeout);
        let value: serde_json::Value = Self::send_json(builder).await?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_owned))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Reset a worktree to the default branch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn reset_worktree(&self, directory: &str) -> Result<()> {
        let builder = self
            .request(Method::POST, "/experimental/worktree/reset")?
            .timeout(self.timeout)
            .json(&WorktreeDirectory { directory });
        Self::send_empty(builder).await
    }

    /// Remove a worktree and its branch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn remove_worktree(&self, directory: &str) -> Result<()> {
        let builder = self
            .request(Method::DELETE, "/experimental/worktree")?
            .timeout(self.timeout)
            .json(&WorktreeDirectory { directory });
        Self::send_empty(builder).await
    }
}

/// Consume SSE events until `session.idle` for `session_id`; `false` if the
/// stream ends or fails first.
async fn watch_for_idle(resp: reqwest::Response, session_id: &str) -> bool {
    let mut events = resp.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "event stream error");
                return false;
            }
        };
        if event.event != "session.idle" {
            continue;
        }
        let idle_for = serde_json::from_str::<IdleEvent>(&event.data)
            .ok()
            .and_then(|e| e.session_id)
            .unwrap_or_default();
        if idle_for.is_empty() || idle_for == session_id {
            debug!(session_id, "session.idle received");
            return true;
        }
    }
    warn!("event stream closed before session became idle");
    false
}
