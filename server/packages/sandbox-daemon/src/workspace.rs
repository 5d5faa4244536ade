//! Git-backed workspace rooted at a single directory.
//!
//! Every repo path is resolved against the workspace root and validated before
//! anything is written: a request that would escape the root fails as a whole.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;
use sandbox_daemon_error::DaemonError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::event_log::EventLog;
use crate::events::DaemonEvent;
use crate::git::{self, GitError};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Clone URL or local path of the repository.
    pub source: String,
    /// Destination relative to the workspace root.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRepo {
    pub id: String,
    pub source: String,
    pub path: String,
    #[schema(value_type = String)]
    pub abs_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
    /// False when an existing checkout was reused.
    pub cloned: bool,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("repo {repo}: path `{path}` resolves outside the workspace root")]
    PathEscape { repo: String, path: String },
    #[error("repo {repo}: invalid path `{path}`: {reason}")]
    InvalidPath {
        repo: String,
        path: String,
        reason: String,
    },
    #[error("repo {repo}: {reason}")]
    InvalidSpec { repo: String, reason: String },
    #[error("repo {repo}: `{path}` conflicts with existing content: {reason}")]
    Conflict {
        repo: String,
        path: String,
        reason: String,
    },
    #[error("repo {repo}: {source}")]
    Git {
        repo: String,
        #[source]
        source: GitError,
    },
    #[error("repo {repo}: i/o error at {}: {source}", path.display())]
    Io {
        repo: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<WorkspaceError> for DaemonError {
    fn from(err: WorkspaceError) -> Self {
        let message = err.to_string();
        match err {
            WorkspaceError::PathEscape { repo, path } => DaemonError::PathEscape { repo, path },
            WorkspaceError::InvalidPath { repo, path, reason } => {
                DaemonError::InvalidPath { repo, path, reason }
            }
            WorkspaceError::InvalidSpec { .. } => DaemonError::InvalidRequest { message },
            WorkspaceError::Conflict { repo, path, reason } => {
                DaemonError::WorkspaceConflict { repo, path, reason }
            }
            WorkspaceError::Git { repo, .. } | WorkspaceError::Io { repo, .. } => {
                DaemonError::GitFailed {
                    repo: Some(repo),
                    message,
                }
            }
        }
    }
}

enum Destination {
    Absent,
    Matching,
    Conflict(String),
}

#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    repos: RwLock<Vec<WorkspaceRepo>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            repos: RwLock::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Repos from the last successful `init`, primary first.
    pub fn repos(&self) -> Vec<WorkspaceRepo> {
        self.repos.read().clone()
    }

    pub fn repo(&self, id: &str) -> Option<WorkspaceRepo> {
        self.repos.read().iter().find(|repo| repo.id == id).cloned()
    }

    pub fn primary(&self) -> Option<WorkspaceRepo> {
        self.repos.read().first().cloned()
    }

    /// Resolves `path` under the root without touching the filesystem beyond
    /// reading metadata of existing ancestors.
    pub fn resolve(&self, repo: &str, path: &str) -> Result<PathBuf, WorkspaceError> {
        let escape = || WorkspaceError::PathEscape {
            repo: repo.to_string(),
            path: path.to_string(),
        };

        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(escape());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(WorkspaceError::InvalidPath {
                repo: repo.to_string(),
                path: path.to_string(),
                reason: "path must name a directory below the workspace root".to_string(),
            });
        }

        let destination = self.root.join(&normalized);
        if !self.contained(&destination) {
            return Err(escape());
        }
        Ok(destination)
    }

    /// Guards against symlinks inside the root that point elsewhere.
    fn contained(&self, destination: &Path) -> bool {
        let Ok(root) = self.root.canonicalize() else {
            // Nothing exists under a missing root, so nothing can be a link.
            return true;
        };
        for ancestor in destination.ancestors() {
            match ancestor.canonicalize() {
                Ok(real) => return real.starts_with(&root),
                // A dangling link cannot be verified.
                Err(_) if ancestor.symlink_metadata().is_ok() => return false,
                Err(_) => {}
            }
        }
        false
    }

    pub async fn init(
        &self,
        repos: &[RepoSpec],
        vcs_token: Option<&str>,
        events: &EventLog,
    ) -> Result<Vec<WorkspaceRepo>, WorkspaceError> {
        let mut plans = Vec::with_capacity(repos.len());
        let mut destinations = HashSet::new();
        for spec in repos {
            let id = repo_id(spec);
            if spec.source.trim().is_empty() {
                return Err(WorkspaceError::InvalidSpec {
                    repo: id,
                    reason: "source is required".to_string(),
                });
            }
            let destination = self.resolve(&id, &spec.path)?;
            if !destinations.insert(destination.clone()) {
                return Err(WorkspaceError::InvalidPath {
                    repo: id,
                    path: spec.path.clone(),
                    reason: "another repo in this request uses the same path".to_string(),
                });
            }
            plans.push((id, spec, destination));
        }

        let mut ensured = Vec::with_capacity(plans.len());
        for (id, spec, destination) in plans {
            let repo = self.ensure_repo(id, spec, destination, vcs_token).await?;
            tracing::info!(
                repo = %repo.id,
                path = %repo.path,
                branch = repo.current_branch.as_deref().unwrap_or("-"),
                cloned = repo.cloned,
                "workspace repo ready"
            );
            events.append(DaemonEvent::RepoCloned {
                id: repo.id.clone(),
                path: repo.path.clone(),
                abs_path: repo.abs_path.to_string_lossy().to_string(),
                branch: repo.current_branch.clone(),
                cloned: repo.cloned,
            });
            ensured.push(repo);
        }

        *self.repos.write() = ensured.clone();
        Ok(ensured)
    }

    async fn ensure_repo(
        &self,
        id: String,
        spec: &RepoSpec,
        destination: PathBuf,
        vcs_token: Option<&str>,
    ) -> Result<WorkspaceRepo, WorkspaceError> {
        let io_error = |path: &Path, source: io::Error| WorkspaceError::Io {
            repo: id.clone(),
            path: path.to_path_buf(),
            source,
        };
        let git_error = |source: GitError| WorkspaceError::Git {
            repo: id.clone(),
            source,
        };

        let inspected = inspect(&destination, &spec.source)
            .await
            .map_err(|source| io_error(&destination, source))?;
        let cloned = match inspected {
            Destination::Absent => {
                let parent = destination.parent().unwrap_or(&self.root).to_path_buf();
                tokio::fs::create_dir_all(&parent)
                    .await
                    .map_err(|source| io_error(&parent, source))?;
                let target = destination.to_string_lossy().to_string();
                let mut args = vec!["clone"];
                if let Some(branch) = spec.branch.as_deref() {
                    args.extend(["--branch", branch]);
                }
                args.extend(["--", spec.source.as_str(), target.as_str()]);
                git::run_checked(&parent, &args, &git::auth_env(&spec.source, vcs_token))
                    .await
                    .map_err(git_error)?;
                true
            }
            Destination::Matching => false,
            Destination::Conflict(reason) => {
                return Err(WorkspaceError::Conflict {
                    repo: id,
                    path: spec.path.clone(),
                    reason,
                })
            }
        };

        if !cloned {
            if let Some(branch) = spec.branch.as_deref() {
                let current = git::current_branch(&destination).await;
                if current.as_deref() != Some(branch) {
                    checkout(&destination, branch, &spec.source, vcs_token)
                        .await
                        .map_err(git_error)?;
                }
            }
        }

        Ok(WorkspaceRepo {
            current_branch: git::current_branch(&destination).await,
            id,
            source: spec.source.clone(),
            path: spec.path.clone(),
            abs_path: destination,
            cloned,
        })
    }
}

fn repo_id(spec: &RepoSpec) -> String {
    if let Some(id) = spec.id.as_deref().filter(|id| !id.trim().is_empty()) {
        return id.to_string();
    }
    Path::new(&spec.path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .last()
        .unwrap_or_else(|| spec.path.clone())
}

async fn inspect(destination: &Path, source: &str) -> io::Result<Destination> {
    let metadata = match tokio::fs::symlink_metadata(destination).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Destination::Absent),
        Err(err) => return Err(err),
    };
    if !metadata.is_dir() {
        return Ok(Destination::Conflict(
            "path exists and is not a directory".to_string(),
        ));
    }
    if tokio::fs::read_dir(destination).await?.next_entry().await?.is_none() {
        return Ok(Destination::Absent);
    }

    let Some(toplevel) = git::toplevel(destination).await else {
        return Ok(Destination::Conflict(
            "directory is not empty and is not a git repository".to_string(),
        ));
    };
    let real_destination = destination.canonicalize()?;
    if toplevel.canonicalize().unwrap_or(toplevel) != real_destination {
        return Ok(Destination::Conflict(
            "directory is inside another git repository".to_string(),
        ));
    }
    let Some(origin) = git::remote_url(destination, "origin").await else {
        return Ok(Destination::Conflict(
            "repository has no origin remote".to_string(),
        ));
    };
    if !same_source(&origin, source) {
        return Ok(Destination::Conflict(format!(
            "repository origin `{}` does not match `{}`",
            git::redact_url(&origin),
            git::redact_url(source)
        )));
    }
    Ok(Destination::Matching)
}

async fn checkout(
    destination: &Path,
    branch: &str,
    source: &str,
    vcs_token: Option<&str>,
) -> Result<(), GitError> {
    if git::run_checked(destination, &["checkout", branch], &[])
        .await
        .is_ok()
    {
        return Ok(());
    }
    git::run_checked(
        destination,
        &["fetch", "origin", branch],
        &git::auth_env(source, vcs_token),
    )
    .await?;
    let remote_branch = format!("origin/{branch}");
    git::run_checked(
        destination,
        &["checkout", "-b", branch, "--track", &remote_branch],
        &[],
    )
    .await?;
    Ok(())
}

fn same_source(origin: &str, source: &str) -> bool {
    normalize_source(origin) == normalize_source(source)
}

fn normalize_source(source: &str) -> String {
    let trimmed = source.trim();
    let local = Path::new(trimmed);
    if local.is_absolute() {
        if let Ok(real) = local.canonicalize() {
            return real.to_string_lossy().trim_end_matches('/').to_string();
        }
    }
    let redacted = git::redact_url(trimmed);
    let without_slash = redacted.trim_end_matches('/');
    without_slash
        .strip_suffix(".git")
        .unwrap_or(without_slash)
        .to_ascii_lowercase()
}
