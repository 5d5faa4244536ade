//! Error taxonomy shared by the sandbox daemon's HTTP surface.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Stable machine-readable error codes. Clients match on these strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    InvalidRequest,
    Unauthorized,
    TokenExpired,
    Forbidden,
    NotFound,
    PathEscape,
    InvalidPath,
    WorkspaceConflict,
    GitFailed,
    ProviderError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::PathEscape => "path_escape",
            ErrorCode::InvalidPath => "invalid_path",
            ErrorCode::WorkspaceConflict => "workspace_conflict",
            ErrorCode::GitFailed => "git_failed",
            ErrorCode::ProviderError => "provider_error",
            ErrorCode::Internal => "internal",
        }
    }

    pub fn status(self) -> u16 {
        match self {
            ErrorCode::InvalidJson
            | ErrorCode::InvalidRequest
            | ErrorCode::PathEscape
            | ErrorCode::InvalidPath => 400,
            ErrorCode::Unauthorized | ErrorCode::TokenExpired => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::WorkspaceConflict => 409,
            ErrorCode::GitFailed | ErrorCode::ProviderError | ErrorCode::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub ok: bool,
    pub error: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid json: {message}")]
    InvalidJson { message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("token expired")]
    TokenExpired,
    #[error("scope `{required}` required")]
    Forbidden { required: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("repo {repo}: path `{path}` resolves outside the workspace root")]
    PathEscape { repo: String, path: String },
    #[error("repo {repo}: invalid path `{path}`: {reason}")]
    InvalidPath {
        repo: String,
        path: String,
        reason: String,
    },
    #[error("repo {repo}: `{path}` conflicts with existing content: {reason}")]
    WorkspaceConflict {
        repo: String,
        path: String,
        reason: String,
    },
    #[error("git failed: {message}")]
    GitFailed {
        repo: Option<String>,
        message: String,
    },
    #[error("provider error: {message}")]
    ProviderError { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DaemonError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DaemonError::InvalidJson { .. } => ErrorCode::InvalidJson,
            DaemonError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            DaemonError::Unauthorized { .. } => ErrorCode::Unauthorized,
            DaemonError::TokenExpired => ErrorCode::TokenExpired,
            DaemonError::Forbidden { .. } => ErrorCode::Forbidden,
            DaemonError::NotFound { .. } => ErrorCode::NotFound,
            DaemonError::PathEscape { .. } => ErrorCode::PathEscape,
            DaemonError::InvalidPath { .. } => ErrorCode::InvalidPath,
            DaemonError::WorkspaceConflict { .. } => ErrorCode::WorkspaceConflict,
            DaemonError::GitFailed { .. } => ErrorCode::GitFailed,
            DaemonError::ProviderError { .. } => ErrorCode::ProviderError,
            DaemonError::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> u16 {
        self.code().status()
    }

    /// The repo id a workspace failure is attributed to, if any.
    pub fn repo(&self) -> Option<&str> {
        match self {
            DaemonError::PathEscape { repo, .. }
            | DaemonError::InvalidPath { repo, .. }
            | DaemonError::WorkspaceConflict { repo, .. } => Some(repo),
            DaemonError::GitFailed { repo, .. } => repo.as_deref(),
            _ => None,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            ok: false,
            error: self.code(),
            message: self.to_string(),
            repo: self.repo().map(str::to_string),
        }
    }
}
