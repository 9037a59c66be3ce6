//! Body and attachment handlers.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Serialize;
use tracing::error;

use super::{internal_error, not_found};
use crate::app::AppState;
use crate::models::content::{ContentKind, EmailContent};
use crate::models::inbox::Inbox;
use crate::store;

#[derive(Debug, Serialize)]
pub struct AttachmentInfo {
    pub id: i64,
    pub message_id: i64,
    pub attachment_type: &'static str,
    pub filename: Option<String>,
    pub content_type: String,
    pub size: i64,
}

fn attachment_type(relationship: &str) -> &'static str {
    if relationship == "embedded" {
        "inline"
    } else {
        "attachment"
    }
}

/// Embedded parts never expose a filename, mirroring how they are stored.
fn attachment_filename(relationship: &str, filename: &str) -> Option<String> {
    (relationship == "attachment" && !filename.is_empty()).then(|| filename.to_string())
}

async fn ensure_message(state: &AppState, inbox: &Inbox, id: i64) -> Result<(), Response> {
    match store::email_by_id(&state.db, inbox.id, id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(not_found()),
        Err(e) => {
            error!("failed to fetch message {}: {}", id, e);
            Err(internal_error())
        }
    }
}

fn content_headers(content: &EmailContent) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        content
            .mime_type
            .parse()
            .unwrap_or_else(|_| "application/octet-stream".parse().unwrap()),
    );
    if let Some(name) = attachment_filename(&content.relationship, &content.filename) {
        if let Ok(value) = format!("inline; filename=\"{}\"", name).parse() {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    headers
}

async fn send_content(
    state: &AppState,
    inbox: &Inbox,
    id: i64,
    kind: ContentKind,
) -> Response {
    if let Err(resp) = ensure_message(state, inbox, id).await {
        return resp;
    }

    match store::content_by_kind(&state.db, id, kind).await {
        Ok(Some(content)) => (content_headers(&content), content.content).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("failed to fetch {} for message {}: {}", kind.as_str(), id, e);
            internal_error()
        }
    }
}

pub async fn get_text_body(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    send_content(&state, &inbox, id, ContentKind::Text).await
}

pub async fn get_html_body(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    send_content(&state, &inbox, id, ContentKind::Html).await
}

pub async fn get_raw_source(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    send_content(&state, &inbox, id, ContentKind::Raw).await
}

pub async fn list_attachments(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    if let Err(resp) = ensure_message(&state, &inbox, id).await {
        return resp;
    }

    match store::list_attachment_meta(&state.db, id).await {
        Ok(rows) => {
            let out: Vec<AttachmentInfo> = rows
                .into_iter()
                .map(|row| AttachmentInfo {
                    id: row.id,
                    message_id: row.email_id,
                    attachment_type: attachment_type(&row.relationship),
                    filename: attachment_filename(&row.relationship, &row.filename),
                    content_type: row.mime_type,
                    size: row.size,
                })
                .collect();
            Json(out).into_response()
        }
        Err(e) => {
            error!("failed to list attachments for message {}: {}", id, e);
            internal_error()
        }
    }
}

async fn load_attachment(
    state: &AppState,
    inbox: &Inbox,
    id: i64,
    aid: i64,
) -> Result<EmailContent, Response> {
    if let Err(resp) = ensure_message(state, inbox, id).await {
        return Err(resp);
    }

    match store::attachment_by_id(&state.db, id, aid).await {
        Ok(Some(content)) => Ok(content),
        Ok(None) => Err(not_found()),
        Err(e) => {
            error!("failed to fetch attachment {} of message {}: {}", aid, id, e);
            Err(internal_error())
        }
    }
}

pub async fn get_attachment(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id, aid)): Path<(String, i64, i64)>,
) -> impl IntoResponse {
    match load_attachment(&state, &inbox, id, aid).await {
        Ok(content) => Json(AttachmentInfo {
            id: content.id,
            message_id: content.email_id,
            attachment_type: attachment_type(&content.relationship),
            filename: attachment_filename(&content.relationship, &content.filename),
            content_type: content.mime_type,
            size: content.size,
        })
        .into_response(),
        Err(resp) => resp,
    }
}

pub async fn download_attachment(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id, aid)): Path<(String, i64, i64)>,
) -> impl IntoResponse {
    match load_attachment(&state, &inbox, id, aid).await {
        Ok(content) => (content_headers(&content), content.content).into_response(),
        Err(resp) => resp,
    }
}
