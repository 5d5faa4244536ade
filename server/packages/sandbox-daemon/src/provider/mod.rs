//! Coding-agent providers.
//!
//! A provider models the agent's start/prompt/abort/stop lifecycle and
//! publishes whatever the agent reports into the shared [`EventLog`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sandbox_daemon_error::DaemonError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::credentials::CredentialsSnapshot;
use crate::event_log::EventLog;

pub mod fake;
pub mod lazy;
pub mod process;

pub use fake::{FakeCall, FakeProvider};
pub use lazy::LazyProvider;
pub use process::{process_factory, ProcessConfig, ProcessProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StreamingBehavior {
    /// Interrupt the current turn with this message.
    Steer,
    /// Queue the message until the current turn finishes.
    FollowUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_behavior: Option<StreamingBehavior>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("agent transport not started")]
    TransportNotStarted,
    #[error("failed to spawn agent `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("agent i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode agent command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{message}")]
    Failed { message: String },
}

impl ProviderError {
    pub fn failed(message: impl Into<String>) -> Self {
        ProviderError::Failed {
            message: message.into(),
        }
    }
}

impl From<ProviderError> for DaemonError {
    fn from(err: ProviderError) -> Self {
        DaemonError::ProviderError {
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait AgentProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Channel the provider publishes agent events into.
    fn events(&self) -> &EventLog;

    async fn start(&self) -> Result<(), ProviderError>;

    async fn send_prompt(&self, request: &PromptRequest) -> Result<(), ProviderError>;

    /// Requests cancellation of in-flight work. Returns once the request has
    /// been handed to the agent, not once the agent confirms it.
    async fn abort(&self, reason: Option<&str>) -> Result<(), ProviderError>;

    async fn stop(&self) -> Result<(), ProviderError>;

    /// Receives the primary repo's absolute path after workspace init.
    async fn bootstrap(&self, _workspace: &Path) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Everything a factory needs to construct one provider instance.
#[derive(Debug, Clone)]
pub struct ProviderBootstrap {
    pub events: EventLog,
    pub credentials: CredentialsSnapshot,
    pub workspace: Option<PathBuf>,
}

pub type ProviderFactory =
    Arc<dyn Fn(ProviderBootstrap) -> Result<Arc<dyn AgentProvider>, ProviderError> + Send + Sync>;
