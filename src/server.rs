use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::error::ServiceError;
use crate::handler::RequestHandler;

/// Multipart field carrying the image.
pub const UPLOAD_FIELD: &str = "file";

/// Build the HTTP router around a request handler.
pub fn create_router(handler: RequestHandler, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/captcha", post(captcha_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

/// HTTP status for each service outcome.
pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::AdmissionRejected | ServiceError::WorkerStopped => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ServiceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ServiceError::InferenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        detail(status_for(&self), self.to_string())
    }
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

/// Oversized bodies keep axum's 413; any other multipart failure is a 422.
fn multipart_rejection(err: MultipartError) -> Response {
    let status = match err.status() {
        StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    detail(status, err.body_text())
}

/// Solve the uploaded captcha, answering with the text as `text/plain`.
async fn captcha_handler(
    State(handler): State<RequestHandler>,
    mut multipart: Multipart,
) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(UPLOAD_FIELD) => match field.bytes().await {
                Ok(bytes) => {
                    upload = Some(bytes);
                    break;
                }
                Err(e) => return multipart_rejection(e),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return multipart_rejection(e),
        }
    }

    let Some(bytes) = upload else {
        return detail(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("missing multipart field '{}'", UPLOAD_FIELD),
        );
    };

    match handler.solve(&bytes).await {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Health check endpoint
async fn health_handler(State(handler): State<RequestHandler>) -> Response {
    if handler.queue().is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "worker stopped").into_response();
    }
    (StatusCode::OK, "OK").into_response()
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(handler): State<RequestHandler>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handler.metrics().export(),
    )
}
