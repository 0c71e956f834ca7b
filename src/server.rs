//! HTTP surface for reviewers.
//!
//! All requests land in one fallback handler, which validates the path itself.
use std::sync::Arc;

use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info, warn};

use crate::path::{self, PathError};
use crate::resolution::{ResolutionError, ResolutionHandler};

#[derive(Clone)]
pub struct AppState {
    pub resolutions: Arc<ResolutionHandler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handle_toxic_resolution)
        .with_state(state)
}

async fn handle_toxic_resolution(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
) -> Response {
    let path = uri.path();
    if method != Method::POST {
        info!(path, %method, "rejected non-POST resolution request");
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({ "error": "Method not allowed" })),
        )
            .into_response();
    }

    let parts = path::segments(path);
    info!(path, ?parts, length = parts.len(), "resolution request");

    let result = match path::parse(path) {
        Ok(target) => state
            .resolutions
            .resolve(&target.id, target.action)
            .await,
        Err(err) => Err(err.into()),
    };

    match result {
        Ok(resolution) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": resolution.message })),
        )
            .into_response(),
        Err(err) => error_response(path, err),
    }
}

fn error_response(path: &str, err: ResolutionError) -> Response {
    let (status, body) = match &err {
        ResolutionError::InvalidPath(PathError::InvalidFormat { received_parts }) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": err.to_string(), "receivedParts": received_parts }),
        ),
        ResolutionError::InvalidPath(PathError::MissingId) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": err.to_string() }),
        ),
        ResolutionError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": err.to_string() })),
        ResolutionError::Storage(source) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "Error updating document", "details": source.to_string() }),
        ),
    };
    if status.is_server_error() {
        error!(path, status = status.as_u16(), error = %err, "resolution failed");
    } else {
        warn!(path, status = status.as_u16(), error = %err, "resolution rejected");
    }
    (status, Json(body)).into_response()
}
