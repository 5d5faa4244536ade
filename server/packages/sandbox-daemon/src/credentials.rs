//! Latest credentials snapshot plus a monotonically increasing revision.
//!
//! Secret values never leave this module through `Debug`, logs or events;
//! callers that need to describe credentials use [`CredentialsStatus`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body of `POST /credentials`.
#[derive(Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRequest {
    pub version: String,
    /// API keys keyed by LLM provider name (`anthropic`, `openai`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs: Option<VcsCredentials>,
}

impl fmt::Debug for CredentialsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsRequest")
            .field("version", &self.version)
            .field("llm", &self.llm.as_ref().map(|keys| keys.keys().collect::<Vec<_>>()))
            .field("vcs", &self.vcs.is_some())
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VcsCredentials {
    pub token: String,
}

impl fmt::Debug for VcsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VcsCredentials(<redacted>)")
    }
}

#[derive(Clone, Default)]
pub struct CredentialsSnapshot {
    pub version: Option<String>,
    pub llm: BTreeMap<String, String>,
    pub vcs_token: Option<String>,
    pub revision: u64,
}

impl CredentialsSnapshot {
    pub fn llm_key(&self, provider: &str) -> Option<&str> {
        self.llm
            .get(provider)
            .map(String::as_str)
            .filter(|key| !key.is_empty())
    }

    pub fn status(&self) -> CredentialsStatus {
        CredentialsStatus {
            version: self.version.clone(),
            revision: self.revision,
            llm_providers: self
                .llm
                .iter()
                .map(|(provider, key)| (provider.clone(), !key.is_empty()))
                .collect(),
            vcs_token: self.vcs_token.as_deref().is_some_and(|token| !token.is_empty()),
        }
    }
}

impl fmt::Debug for CredentialsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsSnapshot")
            .field("version", &self.version)
            .field("llm", &self.llm.keys().collect::<Vec<_>>())
            .field("vcs_token", &self.vcs_token.is_some())
            .field("revision", &self.revision)
            .finish()
    }
}

/// Externally observable view: presence only, never values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub revision: u64,
    pub llm_providers: BTreeMap<String, bool>,
    pub vcs_token: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialsStore {
    inner: Arc<Mutex<CredentialsSnapshot>>,
}

impl CredentialsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot and returns the new revision.
    pub fn set(&self, request: CredentialsRequest) -> u64 {
        let mut current = self.inner.lock();
        let revision = current.revision + 1;
        *current = CredentialsSnapshot {
            version: Some(request.version),
            llm: request.llm.unwrap_or_default(),
            vcs_token: request.vcs.map(|vcs| vcs.token),
            revision,
        };
        revision
    }

    pub fn get(&self) -> CredentialsSnapshot {
        self.inner.lock().clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    pub fn status(&self) -> CredentialsStatus {
        self.inner.lock().status()
    }
}
