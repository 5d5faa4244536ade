// Shared harness for driving the daemon router in-process.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use sandbox_daemon::auth::{AuthClaims, AuthConfig, Scope};
use sandbox_daemon::event_log::EventLog;
use sandbox_daemon::provider::{AgentProvider, FakeProvider, ProviderBootstrap, ProviderFactory};
use sandbox_daemon::{build_router, AppState};
#[allow(unused_imports)]
use serde_json::{json, Value};
use tower::ServiceExt;

const TEST_SECRET: &str = "integration-secret";

#[allow(dead_code)]
struct TestApp {
    app: Router,
    events: EventLog,
    fakes: Arc<Mutex<Vec<Arc<FakeProvider>>>>,
    fail_prompts: Arc<AtomicBool>,
    root: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestApp {
    fn new() -> Self {
        Self::with_auth(AuthConfig::hs256(TEST_SECRET, None))
    }

    fn with_auth(auth: AuthConfig) -> Self {
        let root = tempfile::tempdir().expect("workspace root");
        let fakes = Arc::new(Mutex::new(Vec::new()));
        let fail_prompts = Arc::new(AtomicBool::new(false));
        let state = AppState::new(
            auth,
            root.path(),
            fake_factory(fakes.clone(), fail_prompts.clone()),
        );
        let events = state.events().clone();
        Self {
            app: build_router(state),
            events,
            fakes,
            fail_prompts,
            root,
        }
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    /// Most recently constructed provider instance.
    fn fake(&self) -> Option<Arc<FakeProvider>> {
        self.fakes.lock().last().cloned()
    }

    fn providers_built(&self) -> usize {
        self.fakes.lock().len()
    }

    fn fail_prompts(&self, fail: bool) {
        self.fail_prompts.store(fail, Ordering::SeqCst);
        if let Some(fake) = self.fake() {
            fake.fail_prompts(fail);
        }
    }
}

fn fake_factory(
    fakes: Arc<Mutex<Vec<Arc<FakeProvider>>>>,
    fail_prompts: Arc<AtomicBool>,
) -> ProviderFactory {
    Arc::new(move |bootstrap: ProviderBootstrap| {
        let fake = Arc::new(FakeProvider::new(bootstrap.events));
        fake.fail_prompts(fail_prompts.load(Ordering::SeqCst));
        fakes.lock().push(fake.clone());
        let provider: Arc<dyn AgentProvider> = fake;
        Ok(provider)
    })
}

fn mint_token(scope: Scope, exp: u64) -> String {
    let claims = AuthClaims {
        sub: Some("integration".to_string()),
        scope,
        exp,
        iss: None,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("mint token")
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs()
}

fn token(scope: Scope) -> String {
    mint_token(scope, unix_now() + 600)
}

fn build_request(
    method: Method,
    path: &str,
    body: Option<String>,
    token: Option<&str>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(body) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(body)
        }
        None => Body::empty(),
    };
    builder.body(body).expect("request")
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Sends a request with an admin token.
async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let token = token(Scope::Admin);
    send_json_as(app, method, path, body, Some(&token)).await
}

async fn send_json_as(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let request = build_request(method, path, body.map(|body| body.to_string()), token);
    let response = app.clone().oneshot(request).await.expect("request handled");
    read_json(response).await
}

async fn send_raw(
    app: &Router,
    method: Method,
    path: &str,
    body: &str,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let request = build_request(method, path, Some(body.to_string()), token);
    let response = app.clone().oneshot(request).await.expect("request handled");
    read_json(response).await
}

fn parse_sse(text: &str) -> Vec<Value> {
    text.split("\n\n")
        .filter_map(|frame| {
            let data: Vec<&str> = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if data.is_empty() {
                None
            } else {
                serde_json::from_str(&data.join("\n")).ok()
            }
        })
        .collect()
}

/// Reads a non-following stream to completion.
async fn read_stream(app: &Router, path: &str, token: &str) -> (StatusCode, Vec<Value>) {
    let request = build_request(Method::GET, path, None, Some(token));
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("stream ended")
        .expect("read stream")
        .to_bytes();
    (status, parse_sse(&String::from_utf8_lossy(&bytes)))
}

/// Reads frames from a live body until `count` envelopes have arrived.
async fn read_envelopes(body: &mut Body, count: usize) -> Vec<Value> {
    let mut text = String::new();
    loop {
        let envelopes = parse_sse(&text);
        if envelopes.len() >= count {
            return envelopes;
        }
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("envelope arrived in time")
            .expect("stream still open")
            .expect("frame");
        if let Ok(data) = frame.into_data() {
            text.push_str(&String::from_utf8_lossy(&data));
        }
    }
}

#[allow(dead_code)]
fn workspace_path(app: &TestApp, relative: &str) -> PathBuf {
    app.root().join(relative)
}
