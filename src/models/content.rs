//! Body-part and attachment rows.

use sqlx::FromRow;

/// How a content row relates to its email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Raw,
    Text,
    Html,
    Attachment,
    Embedded,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Raw => "raw",
            ContentKind::Text => "text",
            ContentKind::Html => "html",
            ContentKind::Attachment => "attachment",
            ContentKind::Embedded => "embedded",
        }
    }
}

/// Full content row, blob included.
#[derive(Debug, Clone, FromRow)]
pub struct EmailContent {
    pub id: i64,
    pub email_id: i64,
    pub relationship: String,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
    pub size: i64,
}

/// Content row without the blob, for attachment listings.
#[derive(Debug, Clone, FromRow)]
pub struct ContentMeta {
    pub id: i64,
    pub email_id: i64,
    pub relationship: String,
    pub mime_type: String,
    pub filename: String,
    pub size: i64,
}

/// Content pending insertion.
#[derive(Debug, Clone)]
pub struct NewContent {
    pub relationship: ContentKind,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}
