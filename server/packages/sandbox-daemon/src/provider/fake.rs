use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{AgentProvider, PromptRequest, ProviderError};
use crate::event_log::EventLog;
use crate::events::{Envelope, StreamEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum FakeCall {
    Start,
    Prompt(PromptRequest),
    Abort(Option<String>),
    Stop,
    Bootstrap(PathBuf),
}

/// In-memory provider double. Records every invocation and emits whatever
/// agent events a test hands it.
#[derive(Debug)]
pub struct FakeProvider {
    name: String,
    events: EventLog,
    started: AtomicBool,
    fail_start: AtomicBool,
    fail_prompts: AtomicBool,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeProvider {
    pub fn new(events: EventLog) -> Self {
        Self::with_name("fake", events)
    }

    pub fn with_name(name: impl Into<String>, events: EventLog) -> Self {
        Self {
            name: name.into(),
            events,
            started: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_prompts: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_prompts(&self, fail: bool) {
        self.fail_prompts.store(fail, Ordering::SeqCst);
    }

    /// Publishes a handcrafted agent event.
    pub fn emit(&self, payload: Value) -> Envelope {
        self.events.append(StreamEvent::Agent(payload))
    }

    fn record(&self, call: FakeCall) {
        self.calls.lock().push(call);
    }

    fn ensure_started(&self) -> Result<(), ProviderError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ProviderError::TransportNotStarted)
        }
    }
}

#[async_trait]
impl AgentProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    async fn start(&self) -> Result<(), ProviderError> {
        self.record(FakeCall::Start);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProviderError::failed("fake provider refused to start"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_prompt(&self, request: &PromptRequest) -> Result<(), ProviderError> {
        self.record(FakeCall::Prompt(request.clone()));
        self.ensure_started()?;
        if self.fail_prompts.load(Ordering::SeqCst) {
            return Err(ProviderError::failed("fake provider rejected prompt"));
        }
        Ok(())
    }

    async fn abort(&self, reason: Option<&str>) -> Result<(), ProviderError> {
        self.record(FakeCall::Abort(reason.map(str::to_string)));
        self.ensure_started()
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.record(FakeCall::Stop);
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn bootstrap(&self, workspace: &Path) -> Result<(), ProviderError> {
        self.record(FakeCall::Bootstrap(workspace.to_path_buf()));
        Ok(())
    }
}
