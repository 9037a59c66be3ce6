//! Database row for an inbox.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A named mailbox. `smtp_pass` and `api_key` hold tagged secret hashes,
/// never plaintext.
#[derive(Debug, Clone, FromRow)]
pub struct Inbox {
    pub id: i64,
    pub name: String,
    pub smtp_pass: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
