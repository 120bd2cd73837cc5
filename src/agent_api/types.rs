//! Request and response bodies of the agent-server API.

use serde::{Deserialize, Serialize};

use crate::config::PermissionRule;

/// Body of `POST /session`.
#[derive(Debug, Serialize)]
pub struct CreateSessionRequest<'a> {
    /// Ordered permission ruleset.
    pub permission: &'a [PermissionRule],
}

/// Response of `POST /session`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionResponse {
    /// Session id assigned by the agent server.
    #[serde(default)]
    pub id: String,
}

/// One part of a structured prompt.
#[derive(Debug, Serialize)]
pub struct PromptPart<'a> {
    /// Part type; always `text` here.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Prompt text.
    pub text: &'a str,
}

/// Body of the prompt endpoints.
#[derive(Debug, Serialize)]
pub struct PromptRequest<'a> {
    /// Prompt parts.
    pub parts: Vec<PromptPart<'a>>,
}

impl<'a> PromptRequest<'a> {
    /// Single text part prompt.
    #[must_use]
    pub fn text(text: &'a str) -> Self {
        Self {
            parts: vec![PromptPart { kind: "text", text }],
        }
    }
}

/// Activity reported by `GET /session/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionActivity {
    /// Waiting for input. Sessions missing from the status map are idle.
    Idle,
    /// Processing a prompt.
    Busy,
    /// Retrying after a provider error.
    Retry,
    /// Status could not be determined.
    Unknown,
}

impl SessionActivity {
    /// Parse the `type` field of a status entry.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "idle" => Self::Idle,
            "busy" => Self::Busy,
            "retry" => Self::Retry,
            _ => Self::Unknown,
        }
    }
}

/// A git worktree managed by the agent server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worktree {
    /// Worktree name.
    #[serde(default)]
    pub name: String,
    /// Branch checked out in the worktree.
    #[serde(default)]
    pub branch: String,
    /// Absolute path of the worktree.
    #[serde(default)]
    pub directory: String,
}

/// Body of `POST /experimental/worktree`.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorktreeRequest<'a> {
    /// Requested name; generated by the server when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    /// Script run after the worktree is initialised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_command: Option<&'a str>,
}

/// Body naming an existing worktree directory.
#[derive(Debug, Serialize)]
pub struct WorktreeDirectory<'a> {
    /// Absolute path of the worktree.
    pub directory: &'a str,
}
