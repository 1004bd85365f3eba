//! Axum middleware for tenancy and request metrics.

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, Method, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::observability::MetricsRecorder;

/// Header naming the caller's project
pub static PROJECT_ID_HEADER: HeaderName = HeaderName::from_static("x-project-id");

/// External project id of the caller, inserted by [`require_project`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext(pub String);

impl ProjectContext {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Reject requests without a usable `X-Project-Id` header.
pub async fn require_project(mut request: Request<Body>, next: Next) -> Result<Response, ApiError> {
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let project = request
        .headers()
        .get(&PROJECT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 255)
        .map(str::to_string);

    match project {
        Some(project) => {
            debug!(project_id = %project, "Resolved project");
            request.extensions_mut().insert(ProjectContext(project));
            Ok(next.run(request).await)
        }
        None => {
            warn!(path = %request.uri().path(), "Request without project id");
            Err(ApiError::unauthorized("Unauthorized: missing X-Project-Id header"))
        }
    }
}

/// Count and time every request by matched route.
pub async fn track_metrics(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    MetricsRecorder::new().record_http_request(
        method.as_str(),
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
