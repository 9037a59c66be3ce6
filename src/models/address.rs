//! Sender/recipient rows extracted from parsed headers.

use sqlx::FromRow;

/// Which header an address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    From,
    To,
    Cc,
    Bcc,
}

impl AddressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressKind::From => "from",
            AddressKind::To => "to",
            AddressKind::Cc => "cc",
            AddressKind::Bcc => "bcc",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Address {
    pub email_id: i64,
    pub kind: String,
    pub address: String,
    pub name: String,
}

/// Address pending insertion, before an email id exists.
#[derive(Debug, Clone)]
pub struct NewAddress {
    pub kind: AddressKind,
    pub address: String,
    pub name: String,
}
