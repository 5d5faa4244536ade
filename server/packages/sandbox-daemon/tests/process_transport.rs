// Process transport behavior against small shell-script agents.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use sandbox_daemon::credentials::{CredentialsRequest, CredentialsStore};
use sandbox_daemon::event_log::EventLog;
use sandbox_daemon::events::{DaemonErrorKind, Envelope, StreamEvent};
use sandbox_daemon::provider::{
    process_factory, AgentProvider, LazyProvider, ProcessConfig, PromptRequest, ProviderError,
    StreamingBehavior,
};
use sandbox_daemon::transport::{ProcessTransport, TransportConfig, TransportState};
use serde_json::json;

fn script(body: &str) -> TransportConfig {
    TransportConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), body.to_string()],
        working_dir: None,
        env: Vec::new(),
        stop_grace: Duration::from_millis(200),
    }
}

const ECHO_AGENT: &str = r#"while IFS= read -r line; do printf '%s\n' "$line"; done"#;

async fn wait_for(events: &EventLog, predicate: impl Fn(&Envelope) -> bool) -> Envelope {
    let mut stream = events.subscribe(1);
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(envelope) = stream.next().await {
            if predicate(&envelope) {
                return envelope;
            }
        }
        panic!("event log closed before a match");
    })
    .await
    .expect("event arrived in time")
}

async fn wait_for_state(transport: &ProcessTransport, expected: TransportState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while transport.state().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("state reached in time");
}

#[tokio::test]
async fn prompts_are_framed_and_agent_lines_forwarded() {
    let events = EventLog::new();
    let transport = ProcessTransport::new(script(ECHO_AGENT), events.clone());
    transport.start().await.expect("start");
    transport.start().await.expect("start is idempotent");
    assert_eq!(transport.state().await, TransportState::Running);

    transport
        .send_prompt(&PromptRequest {
            message: "run tests".to_string(),
            streaming_behavior: Some(StreamingBehavior::Steer),
        })
        .await
        .expect("prompt");
    transport.abort(Some("changed my mind")).await.expect("abort");

    let prompt = wait_for(&events, |envelope| {
        matches!(&envelope.event, StreamEvent::Agent(value) if value["type"] == "prompt")
    })
    .await;
    assert_eq!(
        prompt.event,
        StreamEvent::Agent(json!({
            "type": "prompt",
            "message": "run tests",
            "streamingBehavior": "steer"
        }))
    );
    wait_for(&events, |envelope| {
        matches!(&envelope.event, StreamEvent::Agent(value) if value["type"] == "abort")
    })
    .await;

    transport.stop().await.expect("stop");
    wait_for_state(&transport, TransportState::Stopped).await;
    assert!(events
        .since(0)
        .iter()
        .all(|envelope| !envelope.event.is_daemon_error(DaemonErrorKind::ProviderExited)));
    assert!(matches!(
        transport.abort(None).await,
        Err(ProviderError::TransportNotStarted)
    ));
}

#[tokio::test]
async fn unparseable_lines_do_not_stop_the_transport() {
    let events = EventLog::new();
    let transport = ProcessTransport::new(
        script(r#"echo 'not json'; echo '{"type":"turn_start"}'; exec cat"#),
        events.clone(),
    );
    transport.start().await.expect("start");

    wait_for(&events, |envelope| {
        matches!(&envelope.event, StreamEvent::Agent(value) if value["type"] == "turn_start")
    })
    .await;
    let logged = events.since(0);
    assert!(logged[0].event.is_daemon_error(DaemonErrorKind::InvalidAgentOutput));
    assert_eq!(transport.state().await, TransportState::Running);
    transport.stop().await.expect("stop");
}

#[tokio::test]
async fn non_utf8_output_is_reported_and_reading_continues() {
    let events = EventLog::new();
    let transport = ProcessTransport::new(
        script(r#"printf '\377\n'; sleep 0.2; printf '{"type":"after"}\n'; exec cat"#),
        events.clone(),
    );
    transport.start().await.expect("start");

    wait_for(&events, |envelope| {
        matches!(&envelope.event, StreamEvent::Agent(value) if value["type"] == "after")
    })
    .await;
    let logged = events.since(0);
    assert_eq!(logged.len(), 2);
    assert!(logged[0].event.is_daemon_error(DaemonErrorKind::InvalidAgentOutput));
    assert_eq!(transport.state().await, TransportState::Running);
    transport.stop().await.expect("stop");
}

#[tokio::test]
async fn unexpected_exit_reports_provider_exited() {
    let events = EventLog::new();
    let transport = ProcessTransport::new(script("exit 3"), events.clone());
    transport.start().await.expect("start");

    let exited = wait_for(&events, |envelope| {
        envelope.event.is_daemon_error(DaemonErrorKind::ProviderExited)
    })
    .await;
    let value = serde_json::to_value(&exited.event).expect("serialize");
    assert!(value["data"]["message"]
        .as_str()
        .is_some_and(|message| message.contains('3')));
    wait_for_state(&transport, TransportState::Stopped).await;

    // A crashed agent can be started again.
    transport.start().await.expect("restart");
}

#[tokio::test]
async fn missing_executable_fails_start() {
    let events = EventLog::new();
    let transport = ProcessTransport::new(
        TransportConfig {
            program: "/nonexistent/agent-binary".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            stop_grace: Duration::from_millis(100),
        },
        events.clone(),
    );
    let err = transport.start().await.unwrap_err();
    assert!(matches!(err, ProviderError::Spawn { .. }));
    assert_eq!(transport.state().await, TransportState::Stopped);
    assert!(matches!(
        transport
            .send_prompt(&PromptRequest {
                message: "hello".to_string(),
                streaming_behavior: None,
            })
            .await,
        Err(ProviderError::TransportNotStarted)
    ));
}

#[tokio::test]
async fn stop_kills_agents_that_ignore_stdin() {
    let events = EventLog::new();
    let transport = ProcessTransport::new(script("exec sleep 30"), events.clone());
    transport.start().await.expect("start");
    transport.stop().await.expect("stop");
    assert_eq!(transport.state().await, TransportState::Stopping);
    wait_for_state(&transport, TransportState::Stopped).await;
    assert!(events.since(0).is_empty());
}

#[tokio::test]
async fn lazy_process_provider_picks_up_new_credentials() {
    let events = EventLog::new();
    let credentials = CredentialsStore::new();
    let factory = process_factory(ProcessConfig {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            r#"if [ -n "$ANTHROPIC_API_KEY" ]; then echo '{"type":"ready","key":true}'; else echo '{"type":"ready","key":false}'; fi; exec cat"#
                .to_string(),
        ],
        working_dir: None,
        stop_grace: Duration::from_millis(200),
    });
    let lazy = LazyProvider::new(factory, credentials.clone(), events.clone());

    lazy.start().await.expect("start without key");
    wait_for(&events, |envelope| {
        matches!(&envelope.event, StreamEvent::Agent(value) if value["key"] == false)
    })
    .await;

    credentials.set(CredentialsRequest {
        version: "1".to_string(),
        llm: Some(BTreeMap::from([(
            "anthropic".to_string(),
            "sk-ant-test".to_string(),
        )])),
        vcs: None,
    });
    lazy.start().await.expect("restart with key");
    wait_for(&events, |envelope| {
        matches!(&envelope.event, StreamEvent::Agent(value) if value["key"] == true)
    })
    .await;
    assert_eq!(lazy.active_revision().await, Some(1));
    lazy.stop().await.expect("stop");
}
