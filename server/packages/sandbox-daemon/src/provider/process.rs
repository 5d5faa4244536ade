use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{AgentProvider, PromptRequest, ProviderBootstrap, ProviderError, ProviderFactory};
use crate::credentials::CredentialsSnapshot;
use crate::event_log::EventLog;
use crate::transport::{ProcessTransport, TransportConfig, TransportState};

/// How to launch the agent executable.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Overrides the primary repo as the agent's working directory.
    pub working_dir: Option<PathBuf>,
    pub stop_grace: Duration,
}

impl ProcessConfig {
    pub fn transport_config(&self, bootstrap: &ProviderBootstrap) -> TransportConfig {
        TransportConfig {
            program: self.program.clone(),
            args: self.args.clone(),
            working_dir: self
                .working_dir
                .clone()
                .or_else(|| bootstrap.workspace.clone()),
            env: agent_env(&bootstrap.credentials),
            stop_grace: self.stop_grace,
        }
    }
}

/// Provider backed by a long-lived agent subprocess.
#[derive(Debug)]
pub struct ProcessProvider {
    transport: ProcessTransport,
}

impl ProcessProvider {
    pub fn new(config: TransportConfig, events: EventLog) -> Self {
        Self {
            transport: ProcessTransport::new(config, events),
        }
    }

    pub async fn state(&self) -> TransportState {
        self.transport.state().await
    }
}

#[async_trait]
impl AgentProvider for ProcessProvider {
    fn name(&self) -> &str {
        "process"
    }

    fn events(&self) -> &EventLog {
        self.transport.events()
    }

    async fn start(&self) -> Result<(), ProviderError> {
        self.transport.start().await
    }

    async fn send_prompt(&self, request: &PromptRequest) -> Result<(), ProviderError> {
        self.transport.send_prompt(request).await
    }

    async fn abort(&self, reason: Option<&str>) -> Result<(), ProviderError> {
        self.transport.abort(reason).await
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.transport.stop().await
    }
}

pub fn process_factory(config: ProcessConfig) -> ProviderFactory {
    Arc::new(move |bootstrap: ProviderBootstrap| {
        let transport = config.transport_config(&bootstrap);
        let provider: Arc<dyn AgentProvider> =
            Arc::new(ProcessProvider::new(transport, bootstrap.events));
        Ok(provider)
    })
}

/// Environment handed to the agent for the current credentials.
pub fn agent_env(credentials: &CredentialsSnapshot) -> Vec<(String, String)> {
    let mut env = Vec::new();
    for (provider, key) in &credentials.llm {
        if key.is_empty() {
            continue;
        }
        let names: Vec<String> = match provider.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => vec!["ANTHROPIC_API_KEY".into(), "CLAUDE_API_KEY".into()],
            "openai" | "codex" => vec!["OPENAI_API_KEY".into(), "CODEX_API_KEY".into()],
            "google" | "gemini" => vec!["GEMINI_API_KEY".into()],
            other => vec![format!(
                "{}_API_KEY",
                other.to_ascii_uppercase().replace(['-', '.', ' '], "_")
            )],
        };
        for name in names {
            env.push((name, key.clone()));
        }
    }
    if let Some(token) = credentials.vcs_token.as_deref().filter(|token| !token.is_empty()) {
        env.push(("GH_TOKEN".to_string(), token.to_string()));
        env.push(("GITHUB_TOKEN".to_string(), token.to_string()));
    }
    env
}
