use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::StreamingBehavior;

/// Unit of the event stream: a cursor plus the event it addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cursor: u64,
    pub event: StreamEvent,
}

/// Events are tagged by their origin. Agent payloads are forwarded verbatim
/// from the subprocess and never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Daemon(DaemonEvent),
    Agent(Value),
}

impl StreamEvent {
    pub fn daemon_error(error: DaemonErrorKind, message: impl Into<String>) -> Self {
        StreamEvent::Daemon(DaemonEvent::DaemonError {
            error,
            message: message.into(),
        })
    }

    pub fn is_daemon_error(&self, kind: DaemonErrorKind) -> bool {
        matches!(
            self,
            StreamEvent::Daemon(DaemonEvent::DaemonError { error, .. }) if *error == kind
        )
    }
}

impl From<DaemonEvent> for StreamEvent {
    fn from(event: DaemonEvent) -> Self {
        StreamEvent::Daemon(event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    #[serde(rename_all = "camelCase")]
    PromptQueued {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        streaming_behavior: Option<StreamingBehavior>,
    },
    #[serde(rename_all = "camelCase")]
    RepoCloned {
        id: String,
        path: String,
        abs_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        cloned: bool,
    },
    #[serde(rename_all = "camelCase")]
    InitComplete {
        repos: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_path: Option<String>,
    },
    DaemonError {
        error: DaemonErrorKind,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointCreated {
        repo: String,
        sha: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        pushed: bool,
        created_at: String,
    },
    Reset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ClearActivities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonErrorKind {
    ProviderError,
    ProviderExited,
    InvalidAgentOutput,
    PushFailed,
    WorkspaceFailed,
}
