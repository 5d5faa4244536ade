//! Thin async wrapper over the `git` CLI.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tokio::process::Command;
use url::Url;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: io::Error,
    },
    #[error("git {args} failed: {stderr}")]
    Failed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `git <args>` in `dir`, returning the output whatever the exit status.
pub async fn run(dir: &Path, args: &[&str], env: &[(String, String)]) -> Result<GitOutput, GitError> {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().await.map_err(|source| GitError::Spawn {
        args: display_args(args),
        source,
    })?;
    Ok(GitOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Like [`run`], but a non-zero exit is an error. Returns trimmed stdout.
pub async fn run_checked(
    dir: &Path,
    args: &[&str],
    env: &[(String, String)],
) -> Result<String, GitError> {
    let output = run(dir, args, env).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(GitError::Failed {
            args: display_args(args),
            code: output.code,
            stderr: output.stderr,
        })
    }
}

async fn query(dir: &Path, args: &[&str]) -> Option<String> {
    match run(dir, args, &[]).await {
        Ok(output) if output.success && !output.stdout.is_empty() => Some(output.stdout),
        _ => None,
    }
}

/// Current branch name, or `None` when detached or not a repository.
pub async fn current_branch(dir: &Path) -> Option<String> {
    query(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .filter(|branch| branch != "HEAD")
}

pub async fn toplevel(dir: &Path) -> Option<PathBuf> {
    query(dir, &["rev-parse", "--show-toplevel"])
        .await
        .map(PathBuf::from)
}

pub async fn remote_url(dir: &Path, remote: &str) -> Option<String> {
    query(dir, &["remote", "get-url", remote]).await
}

/// `origin` if configured, otherwise the first remote listed.
pub async fn default_remote(dir: &Path) -> Option<String> {
    let remotes = query(dir, &["remote"]).await?;
    let names: Vec<&str> = remotes.lines().map(str::trim).filter(|name| !name.is_empty()).collect();
    if names.contains(&"origin") {
        return Some("origin".to_string());
    }
    names.first().map(|name| name.to_string())
}

pub async fn head_sha(dir: &Path) -> Option<String> {
    query(dir, &["rev-parse", "HEAD"]).await
}

/// Environment that makes git send `token` as HTTP basic auth for `remote`.
///
/// Passed through `GIT_CONFIG_*` variables so the token is neither written to
/// `.git/config` nor visible in the process arguments. Non-HTTP remotes get no
/// extra configuration.
pub fn auth_env(remote: &str, token: Option<&str>) -> Vec<(String, String)> {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return Vec::new();
    };
    let is_http = Url::parse(remote)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !is_http {
        return Vec::new();
    }
    let credentials = STANDARD.encode(format!("x-access-token:{token}"));
    vec![
        ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
        ("GIT_CONFIG_KEY_0".to_string(), "http.extraHeader".to_string()),
        (
            "GIT_CONFIG_VALUE_0".to_string(),
            format!("Authorization: Basic {credentials}"),
        ),
    ]
}

/// Strips userinfo from URL-shaped values before they reach logs or errors.
pub fn redact_url(value: &str) -> String {
    match Url::parse(value) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => value.to_string(),
    }
}

fn display_args(args: &[&str]) -> String {
    args.iter()
        .map(|arg| redact_url(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
