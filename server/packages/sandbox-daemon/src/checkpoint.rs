//! Commits workspace changes and optionally pushes them upstream.

use std::path::Path;

use sandbox_daemon_error::DaemonError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::event_log::EventLog;
use crate::events::{DaemonErrorKind, DaemonEvent, StreamEvent};
use crate::git::{self, GitError};

pub const DEFAULT_AUTHOR_NAME: &str = "Sandbox Agent";
pub const DEFAULT_AUTHOR_EMAIL: &str = "agent@sandbox.local";
pub const DEFAULT_MESSAGE: &str = "checkpoint";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("repo {repo}: {source}")]
    Git {
        repo: String,
        #[source]
        source: GitError,
    },
    #[error("repo {repo}: commit succeeded but HEAD could not be read")]
    MissingHead { repo: String },
}

impl From<CheckpointError> for DaemonError {
    fn from(err: CheckpointError) -> Self {
        let message = err.to_string();
        match err {
            CheckpointError::Git { repo, .. } | CheckpointError::MissingHead { repo } => {
                DaemonError::GitFailed {
                    repo: Some(repo),
                    message,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    NotRequested,
    Pushed,
    Failed(String),
}

impl PushStatus {
    pub fn pushed(&self) -> bool {
        matches!(self, PushStatus::Pushed)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            PushStatus::Failed(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub repo: String,
    pub sha: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub pushed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: DEFAULT_AUTHOR_NAME.to_string(),
            email: DEFAULT_AUTHOR_EMAIL.to_string(),
        }
    }
}

impl GitIdentity {
    fn env(&self) -> Vec<(String, String)> {
        vec![
            ("GIT_AUTHOR_NAME".to_string(), self.name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), self.email.clone()),
            ("GIT_COMMITTER_NAME".to_string(), self.name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), self.email.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct GitCheckpoint {
    events: EventLog,
    identity: GitIdentity,
}

impl GitCheckpoint {
    pub fn new(events: EventLog, identity: GitIdentity) -> Self {
        Self { events, identity }
    }

    pub fn identity(&self) -> &GitIdentity {
        &self.identity
    }

    /// Stages everything and commits it. Returns `None` without emitting an
    /// event when there is nothing to commit.
    pub async fn commit(
        &self,
        repo: &str,
        dir: &Path,
        message: &str,
        push: bool,
        vcs_token: Option<&str>,
    ) -> Result<Option<(Checkpoint, PushStatus)>, CheckpointError> {
        let git_error = |source: GitError| CheckpointError::Git {
            repo: repo.to_string(),
            source,
        };

        git::run_checked(dir, &["add", "-A"], &[])
            .await
            .map_err(git_error)?;
        let staged = git::run(dir, &["diff", "--cached", "--quiet"], &[])
            .await
            .map_err(git_error)?;
        match staged.code {
            Some(0) => {
                tracing::debug!(repo, "nothing to checkpoint");
                return Ok(None);
            }
            Some(1) => {}
            code => {
                return Err(git_error(GitError::Failed {
                    args: "diff --cached --quiet".to_string(),
                    code,
                    stderr: staged.stderr,
                }))
            }
        }

        git::run_checked(dir, &["commit", "--no-verify", "-m", message], &self.identity.env())
            .await
            .map_err(git_error)?;
        let sha = git::head_sha(dir)
            .await
            .ok_or_else(|| CheckpointError::MissingHead {
                repo: repo.to_string(),
            })?;
        let branch = git::current_branch(dir).await;

        let push_status = if push {
            push_head(dir, vcs_token).await
        } else {
            PushStatus::NotRequested
        };

        let checkpoint = Checkpoint {
            repo: repo.to_string(),
            sha,
            message: message.to_string(),
            branch,
            pushed: push_status.pushed(),
            created_at: now_rfc3339(),
        };
        tracing::info!(
            repo,
            sha = %checkpoint.sha,
            pushed = checkpoint.pushed,
            "checkpoint created"
        );
        self.events.append(DaemonEvent::CheckpointCreated {
            repo: checkpoint.repo.clone(),
            sha: checkpoint.sha.clone(),
            message: checkpoint.message.clone(),
            branch: checkpoint.branch.clone(),
            pushed: checkpoint.pushed,
            created_at: checkpoint.created_at.clone(),
        });
        if let Some(reason) = push_status.error() {
            self.events.append(StreamEvent::daemon_error(
                DaemonErrorKind::PushFailed,
                format!("failed to push checkpoint for {repo}: {reason}"),
            ));
        }
        Ok(Some((checkpoint, push_status)))
    }
}

async fn push_head(dir: &Path, vcs_token: Option<&str>) -> PushStatus {
    let Some(remote) = git::default_remote(dir).await else {
        return PushStatus::Failed("no remote configured".to_string());
    };
    let url = git::remote_url(dir, &remote).await.unwrap_or_default();
    match git::run_checked(dir, &["push", &remote, "HEAD"], &git::auth_env(&url, vcs_token)).await {
        Ok(_) => PushStatus::Pushed,
        Err(err) => {
            tracing::warn!(remote = %remote, error = %err, "checkpoint push failed");
            PushStatus::Failed(err.to_string())
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
