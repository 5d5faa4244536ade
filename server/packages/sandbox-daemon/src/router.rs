use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use futures::{Stream, StreamExt};
use sandbox_daemon_error::{DaemonError, ErrorBody, ErrorCode};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::auth::{AuthConfig, AuthError, Scope};
use crate::checkpoint::{
    Checkpoint, CheckpointError, GitCheckpoint, GitIdentity, DEFAULT_MESSAGE,
};
use crate::config::DaemonConfig;
use crate::cors::{cors_middleware, CorsAllowList};
use crate::credentials::{CredentialsRequest, CredentialsStatus, CredentialsStore, VcsCredentials};
use crate::event_log::EventLog;
use crate::events::{DaemonErrorKind, DaemonEvent, StreamEvent};
use crate::provider::{
    process_factory, AgentProvider, LazyProvider, PromptRequest, ProviderError, ProviderFactory,
    StreamingBehavior,
};
use crate::workspace::{RepoSpec, WorkspaceError, WorkspaceManager, WorkspaceRepo};

/// Everything a daemon instance owns. One per process; never global.
#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    events: EventLog,
    credentials: CredentialsStore,
    provider: Arc<dyn AgentProvider>,
    workspace: WorkspaceManager,
    checkpoint: GitCheckpoint,
    cors: CorsAllowList,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Builds the state around a lazily constructed provider.
    pub fn new(auth: AuthConfig, workspace_root: impl Into<PathBuf>, factory: ProviderFactory) -> Self {
        let events = EventLog::new();
        let credentials = CredentialsStore::new();
        let provider: Arc<dyn AgentProvider> = Arc::new(LazyProvider::new(
            factory,
            credentials.clone(),
            events.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            auth,
            checkpoint: GitCheckpoint::new(events.clone(), GitIdentity::default()),
            events,
            credentials,
            provider,
            workspace: WorkspaceManager::new(workspace_root),
            cors: CorsAllowList::default(),
            shutdown,
        }
    }

    pub fn from_config(config: DaemonConfig) -> Self {
        Self::new(
            config.auth,
            config.workspace_root,
            process_factory(config.agent),
        )
        .with_cors_origins(config.cors_origins)
        .with_git_identity(config.git_identity)
    }

    pub fn with_cors_origins(self, origins: impl IntoIterator<Item = String>) -> Self {
        self.cors.replace(origins);
        self
    }

    pub fn with_git_identity(mut self, identity: GitIdentity) -> Self {
        self.checkpoint = GitCheckpoint::new(self.events.clone(), identity);
        self
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn credentials(&self) -> &CredentialsStore {
        &self.credentials
    }

    pub fn provider(&self) -> Arc<dyn AgentProvider> {
        self.provider.clone()
    }

    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }

    pub fn cors(&self) -> &CorsAllowList {
        &self.cors
    }

    /// Flips to `true` once `/shutdown` has been accepted.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let user_routes = Router::new()
        .route("/prompt", post(post_prompt))
        .route("/abort", post(post_abort))
        .route("/stream", get(get_stream))
        .route("/checkpoint", post(post_checkpoint))
        .route("/reset", post(post_reset))
        .route("/activities/clear", post(post_clear_activities))
        .route_layer(middleware::from_fn_with_state(shared.clone(), require_user));

    let admin_routes = Router::new()
        .route("/credentials", get(get_credentials).post(post_credentials))
        .route("/init", post(post_init))
        .route("/shutdown", post(post_shutdown))
        .route_layer(middleware::from_fn_with_state(shared.clone(), require_admin));

    Router::new()
        .route("/health", get(get_health))
        .merge(user_routes)
        .merge(admin_routes)
        .with_state(shared.clone())
        .layer(middleware::from_fn_with_state(
            shared.cors.clone(),
            cors_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        post_prompt,
        post_abort,
        get_stream,
        get_credentials,
        post_credentials,
        post_init,
        post_checkpoint,
        post_reset,
        post_clear_activities,
        post_shutdown
    ),
    components(
        schemas(
            OkResponse,
            CommandResponse,
            PromptRequest,
            StreamingBehavior,
            AbortRequest,
            CredentialsRequest,
            VcsCredentials,
            CredentialsStatus,
            CredentialsStatusResponse,
            InitRequest,
            InitPrompt,
            WorkspaceSpec,
            CorsSpec,
            RepoSpec,
            WorkspaceRepo,
            WorkspaceInfo,
            InitResponse,
            CheckpointRequest,
            Checkpoint,
            CheckpointResponse,
            ResetRequest,
            ErrorBody,
            ErrorCode
        )
    ),
    tags(
        (name = "agent", description = "Prompt and control the coding agent"),
        (name = "events", description = "Replayable event stream"),
        (name = "admin", description = "Credentials, workspace and lifecycle")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        ApiError::Daemon(err.into())
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        ApiError::Daemon(err.into())
    }
}

impl From<CheckpointError> for ApiError {
    fn from(err: CheckpointError) -> Self {
        ApiError::Daemon(err.into())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Daemon(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::Daemon(err) => err.to_error_body(),
        };
        let status =
            StatusCode::from_u16(body.error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(error = %body.error, message = %body.message, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

/// JSON body extractor that reports failures with the daemon's error codes.
/// An empty body is read as `{}`.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|err| DaemonError::InvalidRequest {
                message: err.body_text(),
            })?;
        let raw: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &bytes
        };
        serde_json::from_slice(raw)
            .map(JsonBody)
            .map_err(|err| classify_json_error(err).into())
    }
}

fn classify_json_error(err: serde_json::Error) -> DaemonError {
    use serde_json::error::Category;
    let message = err.to_string();
    match err.classify() {
        Category::Data => DaemonError::InvalidRequest { message },
        Category::Syntax | Category::Eof | Category::Io => DaemonError::InvalidJson { message },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    fn ok() -> Json<Self> {
        Json(Self { ok: true })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct CommandResponse {
    pub success: bool,
    pub command: String,
}

impl CommandResponse {
    fn accepted(command: &str) -> Json<Self> {
        Json(Self {
            success: true,
            command: command.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StreamQuery {
    /// First cursor to deliver. Defaults to the beginning of the log.
    pub cursor: Option<u64>,
    /// Keep the stream open and deliver new events as they are appended.
    pub follow: Option<String>,
}

impl StreamQuery {
    fn follows(&self) -> bool {
        match self.follow.as_deref() {
            None => false,
            Some(value) => !matches!(value.trim(), "false" | "0" | "no"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsStatusResponse {
    pub ok: bool,
    pub status: CredentialsStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<InitPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    #[serde(default)]
    pub repos: Vec<RepoSpec>,
}

/// Either a bare message or a full prompt request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(untagged)]
pub enum InitPrompt {
    Message(String),
    Request(PromptRequest),
}

impl InitPrompt {
    fn into_request(self) -> PromptRequest {
        match self {
            InitPrompt::Message(message) => PromptRequest {
                message,
                streaming_behavior: None,
            },
            InitPrompt::Request(request) => request,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorsSpec {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    #[schema(value_type = String)]
    pub root: PathBuf,
    pub repos: Vec<WorkspaceRepo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub primary_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub ok: bool,
    pub workspace: WorkspaceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_queued: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRequest {
    /// Repo id; defaults to the primary repo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub ok: bool,
    /// `null` when there was nothing to commit.
    pub checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = OkResponse)),
    tag = "admin"
)]
async fn get_health() -> Json<OkResponse> {
    OkResponse::ok()
}

#[utoipa::path(
    post,
    path = "/prompt",
    request_body = PromptRequest,
    responses(
        (status = 200, body = CommandResponse),
        (status = 400, body = ErrorBody),
        (status = 500, body = ErrorBody)
    ),
    tag = "agent"
)]
async fn post_prompt(
    State(state): State<Arc<AppState>>,
    JsonBody(request): JsonBody<PromptRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(DaemonError::InvalidRequest {
            message: "message must not be empty".to_string(),
        }
        .into());
    }
    dispatch_prompt(&state, &request).await?;
    Ok(CommandResponse::accepted("prompt"))
}

/// Starts the provider if needed and hands it the prompt. Failures are also
/// published to the log so every connected client sees them.
async fn dispatch_prompt(state: &AppState, request: &PromptRequest) -> Result<(), ProviderError> {
    let result = match state.provider.start().await {
        Ok(()) => state.provider.send_prompt(request).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => {
            state.events.append(DaemonEvent::PromptQueued {
                message: request.message.clone(),
                streaming_behavior: request.streaming_behavior,
            });
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %err, "prompt dispatch failed");
            state.events.append(StreamEvent::daemon_error(
                DaemonErrorKind::ProviderError,
                err.to_string(),
            ));
            Err(err)
        }
    }
}

#[utoipa::path(
    post,
    path = "/abort",
    request_body = AbortRequest,
    responses(
        (status = 200, body = CommandResponse),
        (status = 500, body = ErrorBody)
    ),
    tag = "agent"
)]
async fn post_abort(
    State(state): State<Arc<AppState>>,
    JsonBody(request): JsonBody<AbortRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    abort_current(&state, request.reason.as_deref()).await?;
    Ok(CommandResponse::accepted("abort"))
}

async fn abort_current(state: &AppState, reason: Option<&str>) -> Result<(), ProviderError> {
    match state.provider.abort(reason).await {
        Ok(()) => Ok(()),
        Err(ProviderError::TransportNotStarted) => {
            tracing::debug!("abort ignored, agent not started");
            Ok(())
        }
        Err(err) => {
            state.events.append(StreamEvent::daemon_error(
                DaemonErrorKind::ProviderError,
                err.to_string(),
            ));
            Err(err)
        }
    }
}

#[utoipa::path(
    get,
    path = "/stream",
    params(StreamQuery),
    responses(
        (status = 200, description = "text/event-stream, one envelope per `data:` line"),
        (status = 400, body = ErrorBody)
    ),
    tag = "events"
)]
async fn get_stream(
    State(state): State<Arc<AppState>>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|err| DaemonError::InvalidRequest {
        message: err.body_text(),
    })?;
    let cursor = query.cursor.unwrap_or(0);

    if query.follows() {
        let stream = state.events.subscribe(cursor);
        tracing::debug!(
            cursor,
            followers = state.events.subscriber_count(),
            "stream follower attached"
        );
        Ok(Sse::new(to_sse(stream))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        Ok(Sse::new(to_sse(state.events.snapshot(cursor))).into_response())
    }
}

fn to_sse<S>(envelopes: S) -> impl Stream<Item = Result<Event, axum::Error>>
where
    S: Stream<Item = crate::events::Envelope>,
{
    envelopes.map(|envelope| Event::default().json_data(&envelope))
}

#[utoipa::path(
    get,
    path = "/credentials",
    responses((status = 200, body = CredentialsStatusResponse)),
    tag = "admin"
)]
async fn get_credentials(State(state): State<Arc<AppState>>) -> Json<CredentialsStatusResponse> {
    Json(CredentialsStatusResponse {
        ok: true,
        status: state.credentials.status(),
    })
}

#[utoipa::path(
    post,
    path = "/credentials",
    request_body = CredentialsRequest,
    responses(
        (status = 200, body = OkResponse),
        (status = 400, body = ErrorBody)
    ),
    tag = "admin"
)]
async fn post_credentials(
    State(state): State<Arc<AppState>>,
    JsonBody(request): JsonBody<CredentialsRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if request.version.trim().is_empty() {
        return Err(DaemonError::InvalidRequest {
            message: "version must not be empty".to_string(),
        }
        .into());
    }
    let revision = state.credentials.set(request);
    let status = state.credentials.status();
    tracing::info!(
        revision,
        llm_providers = status.llm_providers.len(),
        vcs_token = status.vcs_token,
        "credentials updated"
    );
    Ok(OkResponse::ok())
}

#[utoipa::path(
    post,
    path = "/init",
    request_body = InitRequest,
    responses(
        (status = 200, body = InitResponse),
        (status = 400, body = ErrorBody),
        (status = 409, body = ErrorBody),
        (status = 500, body = ErrorBody)
    ),
    tag = "admin"
)]
async fn post_init(
    State(state): State<Arc<AppState>>,
    JsonBody(request): JsonBody<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    if let Some(cors) = request.cors {
        state.cors.replace(cors.allowed_origins);
    }

    let specs = request.workspace.map(|workspace| workspace.repos).unwrap_or_default();
    let vcs_token = state.credentials.get().vcs_token;
    let repos = match state
        .workspace
        .init(&specs, vcs_token.as_deref(), &state.events)
        .await
    {
        Ok(repos) => repos,
        Err(err) => {
            state.events.append(StreamEvent::daemon_error(
                DaemonErrorKind::WorkspaceFailed,
                err.to_string(),
            ));
            return Err(err.into());
        }
    };

    let primary_path = repos.first().map(|repo| repo.abs_path.clone());
    if let Some(path) = &primary_path {
        state.provider.bootstrap(path).await?;
    }
    state.events.append(DaemonEvent::InitComplete {
        repos: repos.iter().map(|repo| repo.id.clone()).collect(),
        primary_path: primary_path
            .as_ref()
            .map(|path| path.to_string_lossy().to_string()),
    });
    tracing::info!(repos = repos.len(), "workspace initialized");

    let prompt_queued = match request.prompt.map(InitPrompt::into_request) {
        Some(prompt) if !prompt.message.trim().is_empty() => {
            Some(dispatch_prompt(&state, &prompt).await.is_ok())
        }
        _ => None,
    };

    Ok(Json(InitResponse {
        ok: true,
        workspace: WorkspaceInfo {
            root: state.workspace.root().to_path_buf(),
            repos,
            primary_path,
        },
        prompt_queued,
    }))
}

#[utoipa::path(
    post,
    path = "/checkpoint",
    request_body = CheckpointRequest,
    responses(
        (status = 200, body = CheckpointResponse),
        (status = 404, body = ErrorBody),
        (status = 500, body = ErrorBody)
    ),
    tag = "agent"
)]
async fn post_checkpoint(
    State(state): State<Arc<AppState>>,
    JsonBody(request): JsonBody<CheckpointRequest>,
) -> Result<Json<CheckpointResponse>, ApiError> {
    let repo = match request.repo.as_deref() {
        Some(id) => state.workspace.repo(id).ok_or_else(|| DaemonError::NotFound {
            message: format!("unknown repo `{id}`"),
        })?,
        None => state.workspace.primary().ok_or_else(|| DaemonError::NotFound {
            message: "workspace has not been initialized".to_string(),
        })?,
    };
    let message = request
        .message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MESSAGE.to_string());
    let vcs_token = state.credentials.get().vcs_token;

    let result = state
        .checkpoint
        .commit(
            &repo.id,
            &repo.abs_path,
            &message,
            request.push.unwrap_or(false),
            vcs_token.as_deref(),
        )
        .await?;

    let (checkpoint, push_error) = match result {
        Some((checkpoint, push)) => (Some(checkpoint), push.error().map(str::to_string)),
        None => (None, None),
    };
    Ok(Json(CheckpointResponse {
        ok: true,
        checkpoint,
        push_error,
    }))
}

#[utoipa::path(
    post,
    path = "/reset",
    request_body = ResetRequest,
    responses((status = 200, body = OkResponse)),
    tag = "agent"
)]
async fn post_reset(
    State(state): State<Arc<AppState>>,
    JsonBody(request): JsonBody<ResetRequest>,
) -> Json<OkResponse> {
    if let Err(err) = abort_current(&state, request.reason.as_deref()).await {
        tracing::warn!(error = %err, "abort during reset failed");
    }
    state.events.append(DaemonEvent::Reset {
        reason: request.reason,
    });
    OkResponse::ok()
}

#[utoipa::path(
    post,
    path = "/activities/clear",
    responses((status = 200, body = OkResponse)),
    tag = "agent"
)]
async fn post_clear_activities(State(state): State<Arc<AppState>>) -> Json<OkResponse> {
    state.events.append(DaemonEvent::ClearActivities);
    OkResponse::ok()
}

#[utoipa::path(
    post,
    path = "/shutdown",
    responses((status = 200, body = OkResponse)),
    tag = "admin"
)]
async fn post_shutdown(State(state): State<Arc<AppState>>) -> Json<OkResponse> {
    tracing::info!("shutdown requested");
    if let Err(err) = state.provider.stop().await {
        tracing::warn!(error = %err, "failed to stop agent provider");
    }
    state.events.close();
    let _ = state.shutdown.send(true);
    OkResponse::ok()
}

async fn require_user(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    authorize(&state, req, next, Scope::User).await
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    authorize(&state, req, next, Scope::Admin).await
}

async fn authorize(
    state: &AppState,
    mut req: Request<Body>,
    next: Next,
    required: Scope,
) -> Result<Response, ApiError> {
    let claims = state
        .auth
        .authorize(req.headers(), required)
        .inspect_err(|err| {
            tracing::debug!(path = %req.uri().path(), error = %err, "request rejected");
        })?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
