//! Database row for an accepted email.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::address::NewAddress;
use super::content::NewContent;

#[derive(Debug, Clone, FromRow)]
pub struct Email {
    pub id: i64,
    pub inbox_id: i64,
    pub client_addr: String,
    pub is_read: bool,
    pub parse_error: bool,
    pub mail_from: String,
    pub subject: String,
    pub headers_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything a completed DATA transaction persists in one shot: the email
/// row plus its address and content children.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub inbox_id: i64,
    pub client_addr: String,
    pub parse_error: bool,
    pub mail_from: String,
    pub subject: String,
    pub headers_json: String,
    pub addresses: Vec<NewAddress>,
    pub contents: Vec<NewContent>,
}
