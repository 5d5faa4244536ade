//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::auth::AuthConfig;
use crate::checkpoint::{GitIdentity, DEFAULT_AUTHOR_EMAIL, DEFAULT_AUTHOR_NAME};
use crate::provider::ProcessConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2468;
pub const DEFAULT_AGENT_COMMAND: &str = "pi";

/// Control daemon for a single sandboxed coding agent.
#[derive(Parser, Debug)]
#[command(name = "sandbox-daemon", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP control API
    Server(ServerArgs),
    /// Print the OpenAPI document as JSON
    Openapi,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[arg(long, env = "SANDBOX_DAEMON_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, env = "SANDBOX_DAEMON_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory all repos are cloned under. Defaults to `$HOME/workspace`.
    #[arg(long, env = "SANDBOX_DAEMON_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Require bearer tokens (on by default).
    #[arg(long, overrides_with = "no_auth")]
    pub auth: bool,

    /// Accept every request as admin. Only for local development.
    #[arg(long, env = "SANDBOX_DAEMON_NO_AUTH", overrides_with = "auth")]
    pub no_auth: bool,

    /// HS256 secret used to verify bearer tokens.
    #[arg(long, env = "SANDBOX_DAEMON_AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Required `iss` claim, when set.
    #[arg(long, env = "SANDBOX_DAEMON_AUTH_ISSUER")]
    pub auth_issuer: Option<String>,

    #[arg(long, env = "SANDBOX_DAEMON_AGENT_COMMAND", default_value = DEFAULT_AGENT_COMMAND)]
    pub agent_command: String,

    /// Extra argument for the agent command; repeatable.
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    pub agent_args: Vec<String>,

    /// Working directory for the agent instead of the primary repo.
    #[arg(long, env = "SANDBOX_DAEMON_AGENT_CWD")]
    pub agent_cwd: Option<PathBuf>,

    /// Browser origin allowed to call the API; repeatable.
    #[arg(long = "cors-origin", env = "SANDBOX_DAEMON_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    #[arg(long, env = "SANDBOX_DAEMON_GIT_AUTHOR_NAME", default_value = DEFAULT_AUTHOR_NAME)]
    pub git_author_name: String,

    #[arg(long, env = "SANDBOX_DAEMON_GIT_AUTHOR_EMAIL", default_value = DEFAULT_AUTHOR_EMAIL)]
    pub git_author_email: String,

    /// Seconds a stopping agent may drain before it is killed.
    #[arg(long, env = "SANDBOX_DAEMON_STOP_GRACE_SECS", default_value_t = 5)]
    pub stop_grace_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("auth is enabled but no secret was provided (use --auth-secret or --no-auth)")]
    MissingAuthSecret,
    #[error("could not determine a home directory; pass --workspace-root")]
    NoWorkspaceRoot,
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub workspace_root: PathBuf,
    pub auth: AuthConfig,
    pub agent: ProcessConfig,
    pub cors_origins: Vec<String>,
    pub git_identity: GitIdentity,
}

impl ServerArgs {
    pub fn into_config(self) -> Result<DaemonConfig, ConfigError> {
        let auth = if self.no_auth {
            AuthConfig::disabled()
        } else {
            let secret = self
                .auth_secret
                .filter(|secret| !secret.is_empty())
                .ok_or(ConfigError::MissingAuthSecret)?;
            AuthConfig::hs256(secret, self.auth_issuer)
        };

        let workspace_root = match self.workspace_root {
            Some(root) => root,
            None => dirs::home_dir()
                .map(|home| home.join("workspace"))
                .ok_or(ConfigError::NoWorkspaceRoot)?,
        };

        Ok(DaemonConfig {
            host: self.host,
            port: self.port,
            workspace_root,
            auth,
            agent: ProcessConfig {
                program: self.agent_command,
                args: self.agent_args,
                working_dir: self.agent_cwd,
                stop_grace: Duration::from_secs(self.stop_grace_secs),
            },
            cors_origins: self.cors_origins,
            git_identity: GitIdentity {
                name: self.git_author_name,
                email: self.git_author_email,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerArgs {
        let cli = Cli::try_parse_from(
            ["sandbox-daemon", "server"]
                .iter()
                .chain(args.iter())
                .copied(),
        )
        .expect("parse");
        match cli.command {
            Command::Server(args) => args,
            Command::Openapi => panic!("expected server"),
        }
    }

    #[test]
    fn auth_requires_a_secret_unless_disabled() {
        let err = parse(&["--workspace-root", "/tmp/ws"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingAuthSecret));

        let config = parse(&["--no-auth", "--workspace-root", "/tmp/ws"])
            .into_config()
            .expect("config");
        assert!(!config.auth.enabled);
    }

    #[test]
    fn agent_args_and_origins_accumulate() {
        let config = parse(&[
            "--auth-secret",
            "s3cret",
            "--workspace-root",
            "/tmp/ws",
            "--agent-command",
            "pi",
            "--agent-arg",
            "--mode",
            "--agent-arg",
            "rpc",
            "--cors-origin",
            "https://app.example",
            "--port",
            "9000",
        ])
        .into_config()
        .expect("config");
        assert!(config.auth.enabled);
        assert_eq!(config.agent.args, vec!["--mode".to_string(), "rpc".to_string()]);
        assert_eq!(config.cors_origins, vec!["https://app.example".to_string()]);
        assert_eq!(config.port, 9000);
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/ws"));
    }
}
