//! HTTP router and handlers.

use crate::app::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{middleware, Json, Router};

pub mod auth;
pub mod contents;
pub mod inboxes;
pub mod messages;

/// Assemble the API router. Every route runs behind the api-token
/// middleware, which binds the authenticated inbox into the request.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/inboxes/:name", get(inboxes::get_inbox))
        .route("/api/v1/inboxes/:name/clean", patch(inboxes::clean_inbox))
        .route("/api/v1/inboxes/:name/all_read", patch(inboxes::mark_read_inbox))
        .route("/api/v1/inboxes/:name/messages", get(messages::list_messages))
        .route(
            "/api/v1/inboxes/:name/messages/:id",
            get(messages::get_message)
                .patch(messages::update_message)
                .delete(messages::delete_message),
        )
        .route(
            "/api/v1/inboxes/:name/messages/:id/headers",
            get(messages::get_message_headers),
        )
        .route(
            "/api/v1/inboxes/:name/messages/:id/body.txt",
            get(contents::get_text_body),
        )
        .route(
            "/api/v1/inboxes/:name/messages/:id/body.html",
            get(contents::get_html_body),
        )
        .route(
            "/api/v1/inboxes/:name/messages/:id/body.eml",
            get(contents::get_raw_source),
        )
        .route(
            "/api/v1/inboxes/:name/messages/:id/attachments",
            get(contents::list_attachments),
        )
        .route(
            "/api/v1/inboxes/:name/messages/:id/attachments/:aid",
            get(contents::get_attachment),
        )
        .route(
            "/api/v1/inboxes/:name/messages/:id/attachments/:aid/download",
            get(contents::download_attachment),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_token,
        ))
        .layer(DefaultBodyLimit::max(10 * 1024))
        .with_state(state)
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

pub(crate) fn internal_error() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

pub(crate) fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}
