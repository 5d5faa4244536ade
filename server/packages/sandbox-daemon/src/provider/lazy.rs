use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AgentProvider, PromptRequest, ProviderBootstrap, ProviderError, ProviderFactory};
use crate::credentials::CredentialsStore;
use crate::event_log::EventLog;

enum LazyState {
    Uninitialized,
    Active {
        revision: u64,
        workspace: Option<PathBuf>,
        provider: Arc<dyn AgentProvider>,
    },
}

/// Builds the real provider on first `start()` and rebuilds it whenever the
/// credentials revision (or bootstrapped workspace) no longer matches the one
/// it was built with. The superseded instance is stopped, not discarded: it
/// may keep draining into the shared event log.
pub struct LazyProvider {
    factory: ProviderFactory,
    credentials: CredentialsStore,
    events: EventLog,
    workspace: parking_lot::Mutex<Option<PathBuf>>,
    state: Mutex<LazyState>,
}

impl fmt::Debug for LazyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyProvider")
            .field("workspace", &*self.workspace.lock())
            .finish_non_exhaustive()
    }
}

impl LazyProvider {
    pub fn new(factory: ProviderFactory, credentials: CredentialsStore, events: EventLog) -> Self {
        Self {
            factory,
            credentials,
            events,
            workspace: parking_lot::Mutex::new(None),
            state: Mutex::new(LazyState::Uninitialized),
        }
    }

    /// Revision the current instance was built with, if any.
    pub async fn active_revision(&self) -> Option<u64> {
        match &*self.state.lock().await {
            LazyState::Active { revision, .. } => Some(*revision),
            LazyState::Uninitialized => None,
        }
    }

    async fn current(&self) -> Result<Arc<dyn AgentProvider>, ProviderError> {
        match &*self.state.lock().await {
            LazyState::Active { provider, .. } => Ok(provider.clone()),
            LazyState::Uninitialized => Err(ProviderError::TransportNotStarted),
        }
    }
}

#[async_trait]
impl AgentProvider for LazyProvider {
    fn name(&self) -> &str {
        "lazy"
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    async fn start(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let credentials = self.credentials.get();
        let revision = credentials.revision;
        let workspace = self.workspace.lock().clone();

        if let LazyState::Active {
            revision: active_revision,
            workspace: active_workspace,
            provider,
        } = &*state
        {
            if *active_revision == revision && *active_workspace == workspace {
                return provider.start().await;
            }
        }

        if let LazyState::Active {
            revision: previous,
            provider,
            ..
        } = std::mem::replace(&mut *state, LazyState::Uninitialized)
        {
            tracing::info!(
                previous_revision = previous,
                revision,
                provider = provider.name(),
                "replacing agent provider"
            );
            if let Err(err) = provider.stop().await {
                tracing::warn!(error = %err, "failed to stop superseded agent provider");
            }
        }

        let provider = (self.factory)(ProviderBootstrap {
            events: self.events.clone(),
            credentials,
            workspace: workspace.clone(),
        })?;
        *state = LazyState::Active {
            revision,
            workspace,
            provider: provider.clone(),
        };
        tracing::info!(revision, provider = provider.name(), "starting agent provider");
        provider.start().await
    }

    async fn send_prompt(&self, request: &PromptRequest) -> Result<(), ProviderError> {
        self.current().await?.send_prompt(request).await
    }

    async fn abort(&self, reason: Option<&str>) -> Result<(), ProviderError> {
        self.current().await?.abort(reason).await
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        let previous = std::mem::replace(&mut *self.state.lock().await, LazyState::Uninitialized);
        match previous {
            LazyState::Active { provider, .. } => provider.stop().await,
            LazyState::Uninitialized => Ok(()),
        }
    }

    async fn bootstrap(&self, workspace: &Path) -> Result<(), ProviderError> {
        *self.workspace.lock() = Some(workspace.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::credentials::CredentialsRequest;
    use crate::provider::fake::{FakeCall, FakeProvider};

    #[derive(Default)]
    struct Built {
        providers: parking_lot::Mutex<Vec<(ProviderBootstrap, Arc<FakeProvider>)>>,
    }

    impl Built {
        fn count(&self) -> usize {
            self.providers.lock().len()
        }

        fn get(&self, index: usize) -> (ProviderBootstrap, Arc<FakeProvider>) {
            self.providers.lock()[index].clone()
        }
    }

    fn fake_factory(built: Arc<Built>) -> ProviderFactory {
        Arc::new(move |bootstrap: ProviderBootstrap| {
            let fake = Arc::new(FakeProvider::new(bootstrap.events.clone()));
            built.providers.lock().push((bootstrap, fake.clone()));
            let provider: Arc<dyn AgentProvider> = fake;
            Ok(provider)
        })
    }

    fn credentials(key: &str) -> CredentialsRequest {
        CredentialsRequest {
            version: "1".to_string(),
            llm: Some(BTreeMap::from([("anthropic".to_string(), key.to_string())])),
            vcs: None,
        }
    }

    fn prompt() -> PromptRequest {
        PromptRequest {
            message: "hello".to_string(),
            streaming_behavior: None,
        }
    }

    #[tokio::test]
    async fn commands_before_start_fail_not_started() {
        let built = Arc::new(Built::default());
        let lazy = LazyProvider::new(fake_factory(built.clone()), CredentialsStore::new(), EventLog::new());
        assert!(matches!(
            lazy.send_prompt(&prompt()).await,
            Err(ProviderError::TransportNotStarted)
        ));
        assert!(matches!(
            lazy.abort(None).await,
            Err(ProviderError::TransportNotStarted)
        ));
        assert_eq!(built.count(), 0);
    }

    #[tokio::test]
    async fn same_revision_reuses_instance() {
        let built = Arc::new(Built::default());
        let lazy = LazyProvider::new(fake_factory(built.clone()), CredentialsStore::new(), EventLog::new());
        lazy.start().await.expect("first start");
        lazy.start().await.expect("second start");
        lazy.send_prompt(&prompt()).await.expect("prompt");

        assert_eq!(built.count(), 1);
        assert_eq!(lazy.active_revision().await, Some(0));
        let (_, fake) = built.get(0);
        assert_eq!(
            fake.calls(),
            vec![FakeCall::Start, FakeCall::Start, FakeCall::Prompt(prompt())]
        );
    }

    #[tokio::test]
    async fn credential_change_rebuilds_and_stops_previous() {
        let built = Arc::new(Built::default());
        let store = CredentialsStore::new();
        let events = EventLog::new();
        let lazy = LazyProvider::new(fake_factory(built.clone()), store.clone(), events.clone());

        lazy.start().await.expect("start");
        let (_, first) = built.get(0);
        first.emit(json!({ "type": "turn_start" }));

        store.set(credentials("sk-new"));
        lazy.start().await.expect("restart");

        assert_eq!(built.count(), 2);
        assert_eq!(lazy.active_revision().await, Some(1));
        assert_eq!(first.calls().last(), Some(&FakeCall::Stop));

        let (bootstrap, second) = built.get(1);
        assert_eq!(bootstrap.credentials.llm_key("anthropic"), Some("sk-new"));
        assert!(second.is_started());
        // Events from the superseded instance stay in the log.
        assert_eq!(events.since(0).len(), 1);

        lazy.start().await.expect("no-op start");
        assert_eq!(built.count(), 2);
    }

    #[tokio::test]
    async fn bootstrap_workspace_flows_into_next_construction() {
        let built = Arc::new(Built::default());
        let lazy = LazyProvider::new(fake_factory(built.clone()), CredentialsStore::new(), EventLog::new());
        lazy.start().await.expect("start");
        lazy.bootstrap(Path::new("/workspace/app")).await.expect("bootstrap");
        lazy.start().await.expect("rebuild");

        assert_eq!(built.count(), 2);
        let (bootstrap, _) = built.get(1);
        assert_eq!(bootstrap.workspace, Some(PathBuf::from("/workspace/app")));
    }

    #[tokio::test]
    async fn factory_failure_leaves_provider_uninitialized() {
        let attempts = Arc::new(parking_lot::Mutex::new(0));
        let counter = attempts.clone();
        let factory: ProviderFactory = Arc::new(move |bootstrap: ProviderBootstrap| {
            let mut attempts = counter.lock();
            *attempts += 1;
            if bootstrap.credentials.revision == 0 {
                return Err(ProviderError::failed("missing api key"));
            }
            let provider: Arc<dyn AgentProvider> = Arc::new(FakeProvider::new(bootstrap.events));
            Ok(provider)
        });
        let store = CredentialsStore::new();
        let lazy = LazyProvider::new(factory, store.clone(), EventLog::new());

        assert!(lazy.start().await.is_err());
        assert_eq!(lazy.active_revision().await, None);

        store.set(credentials("sk"));
        lazy.start().await.expect("start after credentials");
        lazy.send_prompt(&prompt()).await.expect("prompt");
        assert_eq!(*attempts.lock(), 2);
    }

    #[tokio::test]
    async fn stop_resets_to_uninitialized() {
        let built = Arc::new(Built::default());
        let lazy = LazyProvider::new(fake_factory(built.clone()), CredentialsStore::new(), EventLog::new());
        lazy.start().await.expect("start");
        lazy.stop().await.expect("stop");
        assert_eq!(lazy.active_revision().await, None);
        assert!(matches!(
            lazy.send_prompt(&prompt()).await,
            Err(ProviderError::TransportNotStarted)
        ));
    }
}
