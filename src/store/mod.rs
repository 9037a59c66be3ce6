//! Storage interface over the data model.
//!
//! Every consumer (the SMTP engine, the HTTP API, the CLI) goes through
//! these functions; nothing else touches the tables. The SMTP engine only
//! ever calls [`inbox_by_name`] (AUTH) and [`save_email`] (DATA).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::content::{ContentKind, ContentMeta, EmailContent};
use crate::models::email::{Email, NewEmail};
use crate::models::inbox::Inbox;

pub async fn create_inbox(
    pool: &SqlitePool,
    name: &str,
    smtp_pass: &str,
    api_key: &str,
) -> Result<Inbox, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO inboxes (name, smtp_pass, api_key, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(smtp_pass)
    .bind(api_key)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    inbox_by_id(pool, result.last_insert_rowid())
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn inbox_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Inbox>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM inboxes WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

pub async fn inbox_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Inbox>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM inboxes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_inboxes(pool: &SqlitePool) -> Result<Vec<Inbox>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM inboxes ORDER BY id")
        .fetch_all(pool)
        .await
}

pub async fn rotate_inbox_secrets(
    pool: &SqlitePool,
    id: i64,
    smtp_pass: &str,
    api_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE inboxes SET smtp_pass = ?, api_key = ?, updated_at = ? WHERE id = ?")
        .bind(smtp_pass)
        .bind(api_key)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete an inbox; emails, addresses and contents cascade.
pub async fn delete_inbox(pool: &SqlitePool, id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM inboxes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Delete all of an inbox's emails, keeping the inbox itself.
pub async fn clean_inbox(pool: &SqlitePool, inbox_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM emails WHERE inbox_id = ?")
        .bind(inbox_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn mark_inbox_read(pool: &SqlitePool, inbox_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE emails SET is_read = 1, updated_at = ? WHERE inbox_id = ?")
        .bind(Utc::now())
        .bind(inbox_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_emails(pool: &SqlitePool, inbox_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT count(*) FROM emails WHERE inbox_id = ?")
        .bind(inbox_id)
        .fetch_one(pool)
        .await
}

pub async fn count_unread_emails(pool: &SqlitePool, inbox_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT count(*) FROM emails WHERE inbox_id = ? AND is_read = 0")
        .bind(inbox_id)
        .fetch_one(pool)
        .await
}

pub async fn latest_email_at(
    pool: &SqlitePool,
    inbox_id: i64,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT created_at FROM emails WHERE inbox_id = ? ORDER BY created_at DESC LIMIT 1",
    )
    .bind(inbox_id)
    .fetch_optional(pool)
    .await
}

/// Collapse whitespace runs and LIKE metacharacters in a user-supplied
/// search term into single `%` wildcards.
pub fn collapse_search(term: &str) -> String {
    let mut out = String::new();
    let mut wildcard = false;
    for c in term.trim().chars() {
        if c.is_whitespace() || c == '%' || c == '_' {
            if !wildcard {
                out.push('%');
                wildcard = true;
            }
        } else {
            out.push(c);
            wildcard = false;
        }
    }
    out
}

/// Newest-first page of an inbox's emails. `page` is 1-based; a non-empty
/// `search` filters on a subject substring.
pub async fn list_emails(
    pool: &SqlitePool,
    inbox_id: i64,
    page: u32,
    size: u32,
    search: Option<&str>,
) -> Result<Vec<Email>, sqlx::Error> {
    let offset = (page.max(1) - 1) as i64 * size as i64;
    let like = search
        .map(collapse_search)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s));

    match like {
        Some(like) => {
            sqlx::query_as(
                "SELECT * FROM emails WHERE inbox_id = ? AND subject LIKE ? ORDER BY id DESC LIMIT ? OFFSET ?",
            )
            .bind(inbox_id)
            .bind(like)
            .bind(size as i64)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(
                "SELECT * FROM emails WHERE inbox_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
            )
            .bind(inbox_id)
            .bind(size as i64)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
}

pub async fn email_by_id(
    pool: &SqlitePool,
    inbox_id: i64,
    id: i64,
) -> Result<Option<Email>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM emails WHERE inbox_id = ? AND id = ?")
        .bind(inbox_id)
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn set_email_read(
    pool: &SqlitePool,
    id: i64,
    is_read: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE emails SET is_read = ?, updated_at = ? WHERE id = ?")
        .bind(is_read)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_email(pool: &SqlitePool, id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM emails WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn email_addresses(
    pool: &SqlitePool,
    email_id: i64,
) -> Result<Vec<crate::models::address::Address>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM addresses WHERE email_id = ? ORDER BY rowid")
        .bind(email_id)
        .fetch_all(pool)
        .await
}

/// The single content row of a given relationship, if present.
pub async fn content_by_kind(
    pool: &SqlitePool,
    email_id: i64,
    kind: ContentKind,
) -> Result<Option<EmailContent>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM email_contents WHERE email_id = ? AND relationship = ?")
        .bind(email_id)
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await
}

/// Sizes of the raw/text/html rows, for message summaries. Missing rows
/// report zero.
pub async fn body_sizes(pool: &SqlitePool, email_id: i64) -> Result<(i64, i64, i64), sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT relationship, size FROM email_contents WHERE email_id = ? AND relationship IN ('raw', 'text', 'html')",
    )
    .bind(email_id)
    .fetch_all(pool)
    .await?;

    let mut raw = 0;
    let mut text = 0;
    let mut html = 0;
    for (rel, size) in rows {
        match rel.as_str() {
            "raw" => raw = size,
            "text" => text = size,
            "html" => html = size,
            _ => {}
        }
    }
    Ok((raw, text, html))
}

/// Attachment and embedded rows for an email, metadata only.
pub async fn list_attachment_meta(
    pool: &SqlitePool,
    email_id: i64,
) -> Result<Vec<ContentMeta>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, email_id, relationship, mime_type, filename, size FROM email_contents \
         WHERE email_id = ? AND relationship IN ('attachment', 'embedded') ORDER BY id",
    )
    .bind(email_id)
    .fetch_all(pool)
    .await
}

pub async fn attachment_by_id(
    pool: &SqlitePool,
    email_id: i64,
    id: i64,
) -> Result<Option<EmailContent>, sqlx::Error> {
    sqlx::query_as(
        "SELECT * FROM email_contents WHERE email_id = ? AND id = ? \
         AND relationship IN ('attachment', 'embedded')",
    )
    .bind(email_id)
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Persist one accepted message atomically: the email row and all of its
/// address and content children commit together or not at all.
pub async fn save_email(pool: &SqlitePool, email: NewEmail) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let result = sqlx::query(
        "INSERT INTO emails (inbox_id, client_addr, is_read, parse_error, mail_from, subject, headers_json, created_at, updated_at) \
         VALUES (?, ?, 0, ?, ?, ?, ?, ?, ?)",
    )
    .bind(email.inbox_id)
    .bind(&email.client_addr)
    .bind(email.parse_error)
    .bind(&email.mail_from)
    .bind(&email.subject)
    .bind(&email.headers_json)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let email_id = result.last_insert_rowid();

    for addr in &email.addresses {
        sqlx::query("INSERT INTO addresses (email_id, kind, address, name) VALUES (?, ?, ?, ?)")
            .bind(email_id)
            .bind(addr.kind.as_str())
            .bind(&addr.address)
            .bind(&addr.name)
            .execute(&mut *tx)
            .await?;
    }

    for content in &email.contents {
        sqlx::query(
            "INSERT INTO email_contents (email_id, relationship, content, mime_type, filename, size) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(email_id)
        .bind(content.relationship.as_str())
        .bind(&content.content)
        .bind(&content.mime_type)
        .bind(&content.filename)
        .bind(content.content.len() as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(email_id)
}
