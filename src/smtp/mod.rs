//! SMTP protocol engine: acceptor, per-connection sessions, command
//! parsing, and message decomposition.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::secrets::HasherPool;

pub mod error;
pub mod message;
pub mod parse;
pub mod session;
pub mod stream;

use session::Session;

/// Listens for SMTP clients and runs one independent [`Session`] per
/// connection. Sessions share only the storage pool and the hasher pool.
pub struct SmtpServer {
    db: SqlitePool,
    tls: Option<TlsAcceptor>,
    max_msg_bytes: usize,
    hashers: Arc<HasherPool>,
}

impl SmtpServer {
    pub fn new(
        db: SqlitePool,
        tls: Option<TlsAcceptor>,
        max_msg_bytes: usize,
        hashers: Arc<HasherPool>,
    ) -> Self {
        Self {
            db,
            tls,
            max_msg_bytes,
            hashers,
        }
    }

    /// Accept connections forever. A listener error is fatal and propagates;
    /// session errors are logged and never affect other sessions.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let mut session = Session::new(
                stream,
                peer,
                self.tls.clone(),
                self.max_msg_bytes,
                self.db.clone(),
                self.hashers.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = session.serve().await {
                    warn!("smtp connection error from {}: {}", peer, e);
                }
            });
        }
    }
}
