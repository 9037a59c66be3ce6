//! Message JSON APIs.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

use super::{internal_error, not_found};
use crate::app::AppState;
use crate::models::email::Email;
use crate::models::inbox::Inbox;
use crate::store;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MailAddress {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct MessageSummary {
    pub id: i64,
    pub inbox_id: i64,
    pub subject: String,
    pub is_read: bool,
    pub parse_error: bool,
    pub mail_from: String,
    pub client_addr: String,
    pub addresses: BTreeMap<&'static str, Vec<MailAddress>>,
    pub email_size: i64,
    pub text_body_size: i64,
    pub html_body_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessage {
    pub is_read: bool,
}

#[derive(Debug, Serialize)]
pub struct HeadersResponse {
    pub headers: BTreeMap<String, String>,
    pub multi_headers: BTreeMap<String, Vec<String>>,
}

pub(crate) async fn build_message_summary(
    state: &AppState,
    email: &Email,
) -> Result<MessageSummary, sqlx::Error> {
    let mut addresses: BTreeMap<&'static str, Vec<MailAddress>> = BTreeMap::from([
        ("from", Vec::new()),
        ("to", Vec::new()),
        ("cc", Vec::new()),
        ("bcc", Vec::new()),
    ]);

    for row in store::email_addresses(&state.db, email.id).await? {
        if let Some(list) = addresses.get_mut(row.kind.as_str()) {
            list.push(MailAddress {
                name: row.name,
                address: row.address,
            });
        }
    }

    let (email_size, text_body_size, html_body_size) =
        store::body_sizes(&state.db, email.id).await?;

    Ok(MessageSummary {
        id: email.id,
        inbox_id: email.inbox_id,
        subject: email.subject.clone(),
        is_read: email.is_read,
        parse_error: email.parse_error,
        mail_from: email.mail_from.clone(),
        client_addr: email.client_addr.clone(),
        addresses,
        email_size,
        text_body_size,
        html_body_size,
        created_at: email.created_at,
        updated_at: email.updated_at,
    })
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let page = params.page.unwrap_or(1).max(1);
    let size = params.size.unwrap_or(30).clamp(1, 200);

    let emails = match store::list_emails(&state.db, inbox.id, page, size, params.search.as_deref())
        .await
    {
        Ok(emails) => emails,
        Err(e) => {
            error!("failed to list messages for inbox {}: {}", inbox.id, e);
            return internal_error();
        }
    };

    let mut out = Vec::with_capacity(emails.len());
    for email in &emails {
        match build_message_summary(&state, email).await {
            Ok(summary) => out.push(summary),
            Err(e) => {
                error!("failed to summarize message {}: {}", email.id, e);
                return internal_error();
            }
        }
    }

    Json(out).into_response()
}

/// Fetch one message scoped to the bound inbox, mapping storage errors to a
/// response.
async fn load_message(state: &AppState, inbox: &Inbox, id: i64) -> Result<Email, axum::response::Response> {
    match store::email_by_id(&state.db, inbox.id, id).await {
        Ok(Some(email)) => Ok(email),
        Ok(None) => Err(not_found()),
        Err(e) => {
            error!("failed to fetch message {}: {}", id, e);
            Err(internal_error())
        }
    }
}

pub async fn get_message(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    let email = match load_message(&state, &inbox, id).await {
        Ok(email) => email,
        Err(resp) => return resp,
    };
    match build_message_summary(&state, &email).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!("failed to summarize message {}: {}", id, e);
            internal_error()
        }
    }
}

pub async fn update_message(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
    Json(body): Json<UpdateMessage>,
) -> impl IntoResponse {
    if let Err(resp) = load_message(&state, &inbox, id).await {
        return resp;
    }

    if let Err(e) = store::set_email_read(&state.db, id, body.is_read).await {
        error!("failed to update message {}: {}", id, e);
        return internal_error();
    }

    let email = match load_message(&state, &inbox, id).await {
        Ok(email) => email,
        Err(resp) => return resp,
    };
    match build_message_summary(&state, &email).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!("failed to summarize message {}: {}", id, e);
            internal_error()
        }
    }
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    let email = match load_message(&state, &inbox, id).await {
        Ok(email) => email,
        Err(resp) => return resp,
    };

    // Snapshot the representation before the row disappears.
    let summary = match build_message_summary(&state, &email).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("failed to summarize message {}: {}", id, e);
            return internal_error();
        }
    };

    if let Err(e) = store::delete_email(&state.db, id).await {
        error!("failed to delete message {}: {}", id, e);
        return internal_error();
    }

    Json(summary).into_response()
}

pub async fn get_message_headers(
    State(state): State<AppState>,
    Extension(inbox): Extension<Inbox>,
    Path((_name, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    let email = match load_message(&state, &inbox, id).await {
        Ok(email) => email,
        Err(resp) => return resp,
    };

    let multi_headers: BTreeMap<String, Vec<String>> =
        match serde_json::from_str(&email.headers_json) {
            Ok(map) => map,
            Err(e) => {
                error!("failed to decode headers for message {}: {}", id, e);
                return internal_error();
            }
        };

    let headers = multi_headers
        .iter()
        .filter_map(|(key, values)| values.first().map(|v| (key.clone(), v.clone())))
        .collect();

    Json(HeadersResponse {
        headers,
        multi_headers,
    })
    .into_response()
}
