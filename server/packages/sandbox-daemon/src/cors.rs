use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "authorization, content-type";
const MAX_AGE: &str = "600";

/// Origins allowed to call the daemon from a browser.
#[derive(Debug, Clone, Default)]
pub struct CorsAllowList {
    origins: Arc<RwLock<Vec<String>>>,
}

impl CorsAllowList {
    pub fn new(origins: impl IntoIterator<Item = String>) -> Self {
        let list = Self::default();
        list.replace(origins);
        list
    }

    pub fn replace(&self, origins: impl IntoIterator<Item = String>) {
        let origins: Vec<String> = origins
            .into_iter()
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        tracing::info!(count = origins.len(), "cors allow-list updated");
        *self.origins.write() = origins;
    }

    pub fn origins(&self) -> Vec<String> {
        self.origins.read().clone()
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.origins
            .read()
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }

    fn matching_origin(&self, headers: &HeaderMap) -> Option<HeaderValue> {
        let origin = headers.get(header::ORIGIN)?;
        let value = origin.to_str().ok()?;
        self.allows(value).then(|| origin.clone())
    }
}

/// Answers preflight requests before any auth runs and stamps the allowed
/// origin onto ordinary responses.
pub async fn cors_middleware(
    State(cors): State<CorsAllowList>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let origin = cors.matching_origin(req.headers());

    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        if let Some(origin) = origin {
            let headers = response.headers_mut();
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOW_METHODS),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOW_HEADERS),
            );
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE));
            headers.insert(header::VARY, HeaderValue::from_static("origin"));
        }
        return response;
    }

    let mut response = next.run(req).await;
    if let Some(origin) = origin {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(header::VARY, HeaderValue::from_static("origin"));
    }
    response
}
