//! Inbox summary and bulk-update handlers.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use super::internal_error;
use crate::app::AppState;
use crate::models::inbox::Inbox;
use crate::store;

#[derive(Debug, Serialize)]
pub struct InboxSummary {
    pub id: i64,
    pub name: String,
    pub emails_count: i64,
    pub emails_unread_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) async fn build_inbox_summary(
    state: &AppState,
    inbox: &Inbox,
) -> Result<InboxSummary, sqlx::Error> {
    Ok(InboxSummary {
        id: inbox.id,
        name: inbox.name.clone(),
        emails_count: store::count_emails(&state.db, inbox.id).await?,
        emails_unread_count: store::count_unread_emails(&state.db, inbox.id).await?,
        last_message_at: store::latest_email_at(&state.db, inbox.id).await?,
        created_at: inbox.created_at,
        updated_at: inbox.updated_at,
    })
}

async fn send_inbox_summary(state: &AppState, inbox: &Inbox) -> axum::response::Response {
    match build_inbox_summary(state, inbox).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!("failed to summarize inbox {}: {}", inbox.id, e);
            internal_error()
        }
    }
}

pub async fn get_inbox(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
) -> impl IntoResponse {
    send_inbox_summary(&state, &inbox).await
}

pub async fn clean_inbox(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
) -> impl IntoResponse {
    if let Err(e) = store::clean_inbox(&state.db, inbox.id).await {
        error!("failed to clean inbox {}: {}", inbox.id, e);
        return internal_error();
    }
    send_inbox_summary(&state, &inbox).await
}

pub async fn mark_read_inbox(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
) -> impl IntoResponse {
    if let Err(e) = store::mark_inbox_read(&state.db, inbox.id).await {
        error!("failed to mark inbox {} read: {}", inbox.id, e);
        return internal_error();
    }
    send_inbox_summary(&state, &inbox).await
}
