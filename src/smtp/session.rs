//! Per-connection SMTP state machine.
//!
//! One session owns one TCP connection and handles commands strictly in
//! sequence; AUTH continuation lines and DATA payloads are consumed inline
//! by their handlers. The session enforces ordering (greeting before
//! envelope, authentication before MAIL), performs the STARTTLS transport
//! upgrade, and turns a completed DATA transaction into one atomic storage
//! write.
//!
//! There is deliberately no read deadline here: a client that stops sending
//! occupies its task until the peer closes. Deployments that need idle
//! timeouts should enforce them in front of the listener.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::models::address::{AddressKind, NewAddress};
use crate::models::content::{ContentKind, NewContent};
use crate::models::email::NewEmail;
use crate::secrets::HasherPool;
use crate::store;

use super::error::SmtpError;
use super::message::{self, DecomposedEmail};
use super::parse;
use super::stream::MailStream;

const AT_YOUR_SERVICE_MULTI_RESP: &str = "250-Postdrop at your service\r\n";
const AUTH_FAILED_RESP: &str = "535 Authentication failed\r\n";
const AUTH_GET_PASS_RESP: &str = "334 UGFzc3dvcmQ6\r\n";
const AUTH_GET_USER_RESP: &str = "334 VXNlcm5hbWU6\r\n";
const AUTH_PLAIN_CREDS_RESP: &str = "334 Provide credentials\r\n";
const AUTH_REQD_RESP: &str = "530 Authentication required\r\n";
const AUTH_SUCCESS_RESP: &str = "235 Authentication successful\r\n";
const BYE_RESP: &str = "221 Bye\r\n";
const CMD_NOT_IMPL_RESP: &str = "502 Command not implemented\r\n";
const CMD_SYNTAX_ERR_RESP: &str = "500 Command syntax error\r\n";
const DOMAIN_REQD_RESP: &str = "501 Domain name required\r\n";
const HELO_REQD_RESP: &str = "503 HELO/EHLO required\r\n";
const HELP_RESP: &str = "214 Refer https://tools.ietf.org/html/rfc5321\r\n";
const MAIL_FROM_REQD_RESP: &str = "503 MAIL FROM required\r\n";
const MAILBOX_FULL_RESP: &str = "552 Mailbox full\r\n";
const MESSAGE_TOO_BIG_RESP: &str = "550 Message too big\r\n";
const MISSING_ARGS_RESP: &str = "501 Missing or invalid arguments\r\n";
const OK_RESP: &str = "250 OK\r\n";
const RCPT_TO_REQD_RESP: &str = "503 RCPT TO required\r\n";
const READY_RESP: &str = "220 ESMTP Postdrop Server ready\r\n";
const READY_TO_START_TLS_RESP: &str = "220 Ready to start TLS\r\n";
const START_INPUT_RESP: &str = "354 Start mail input; end with <CRLF>.<CRLF>\r\n";
const TLS_UNAVAILABLE_RESP: &str = "454 TLS not available due to temporary reason\r\n";
const UNSUPPORTED_AUTH_RESP: &str = "504 Unsupported authentication type\r\n";

pub struct Session {
    io: BufStream<MailStream>,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    is_tls: bool,
    max_msg_bytes: usize,
    db: SqlitePool,
    hashers: Arc<HasherPool>,
    helo_done: bool,
    inbox: Option<i64>,
    mail_from: String,
    rcpt_to: HashSet<String>,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
        max_msg_bytes: usize,
        db: SqlitePool,
        hashers: Arc<HasherPool>,
    ) -> Self {
        Self {
            io: BufStream::new(MailStream::Plain(stream)),
            peer,
            tls,
            is_tls: false,
            max_msg_bytes,
            db,
            hashers,
            helo_done: false,
            inbox: None,
            mail_from: String::new(),
            rcpt_to: HashSet::new(),
        }
    }

    /// Drive the session until QUIT, client disconnect, or a transport
    /// error.
    pub async fn serve(&mut self) -> Result<(), SmtpError> {
        self.send(READY_RESP).await?;

        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                // Client went away without QUIT.
                Err(_) => break,
            };

            let (verb, args) = parse::parse_command(&line);
            match verb.as_str() {
                "" => self.send(CMD_SYNTAX_ERR_RESP).await?,
                "AUTH" => self.handle_auth(&args).await?,
                "DATA" => self.handle_data().await?,
                "EHLO" => self.handle_ehlo(&args).await?,
                "HELO" => self.handle_helo(&args).await?,
                "HELP" => self.handle_help().await?,
                "MAIL" => self.handle_mail(&args).await?,
                "NOOP" => self.handle_noop().await?,
                "QUIT" => {
                    let _ = self.send(BYE_RESP).await;
                    break;
                }
                "RCPT" => self.handle_rcpt(&args).await?,
                "RSET" => self.handle_rset().await?,
                "STARTTLS" => self.handle_starttls().await?,
                _ => self.send(CMD_NOT_IMPL_RESP).await?,
            }
        }

        Ok(())
    }

    async fn send(&mut self, resp: &str) -> Result<(), SmtpError> {
        self.io.write_all(resp.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// One command or continuation line, CRLF stripped, lossily decoded.
    async fn read_line(&mut self) -> Result<String, SmtpError> {
        let mut raw = Vec::new();
        let n = self.io.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed").into());
        }
        Ok(String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }

    /// Drop authentication and the in-progress envelope, keeping the
    /// greeting. Shared by RSET and the STARTTLS upgrade.
    fn reset_state(&mut self) {
        self.inbox = None;
        self.mail_from.clear();
        self.rcpt_to.clear();
    }

    async fn handle_helo(&mut self, args: &str) -> Result<(), SmtpError> {
        if args.is_empty() {
            return self.send(DOMAIN_REQD_RESP).await;
        }

        self.helo_done = true;
        self.send(OK_RESP).await
    }

    async fn handle_ehlo(&mut self, args: &str) -> Result<(), SmtpError> {
        if args.is_empty() {
            return self.send(DOMAIN_REQD_RESP).await;
        }

        self.helo_done = true;
        let mut lines = format!(
            "{}250-SIZE {}\r\n250-PIPELINING\r\n250-8BITMIME\r\n250-SMTPUTF8\r\n250-DSN\r\n250-AUTH PLAIN LOGIN\r\n",
            AT_YOUR_SERVICE_MULTI_RESP, self.max_msg_bytes
        );

        if self.tls.is_some() {
            lines.push_str("250-STARTTLS\r\n");
        }

        lines.push_str(OK_RESP);
        self.send(&lines).await
    }

    async fn handle_rset(&mut self) -> Result<(), SmtpError> {
        self.reset_state();
        self.send(OK_RESP).await
    }

    async fn handle_noop(&mut self) -> Result<(), SmtpError> {
        self.send(OK_RESP).await
    }

    async fn handle_help(&mut self) -> Result<(), SmtpError> {
        self.send(HELP_RESP).await
    }

    async fn handle_starttls(&mut self) -> Result<(), SmtpError> {
        let Some(acceptor) = self.tls.clone() else {
            return self.send(CMD_NOT_IMPL_RESP).await;
        };

        if self.is_tls {
            return self.send(TLS_UNAVAILABLE_RESP).await;
        }

        self.send(READY_TO_START_TLS_RESP).await?;

        let stream = std::mem::replace(&mut self.io, BufStream::new(MailStream::Upgrading));
        let plain = match stream.into_inner() {
            MailStream::Plain(stream) => stream,
            // Guarded by the is_tls check above.
            _ => unreachable!("STARTTLS over an upgraded stream"),
        };

        // A handshake failure propagates and ends the session.
        let tls_stream = acceptor.accept(plain).await?;

        self.io = BufStream::new(MailStream::Tls(tls_stream));
        self.is_tls = true;
        self.reset_state();
        Ok(())
    }

    async fn handle_mail(&mut self, args: &str) -> Result<(), SmtpError> {
        if !self.helo_done {
            return self.send(HELO_REQD_RESP).await;
        }

        if self.inbox.is_none() {
            return self.send(AUTH_REQD_RESP).await;
        }

        match parse::parse_email_args(args) {
            Ok((keyword, addr)) if keyword == "FROM" => {
                self.mail_from = addr;
                self.send(OK_RESP).await
            }
            _ => self.send(MISSING_ARGS_RESP).await,
        }
    }

    async fn handle_rcpt(&mut self, args: &str) -> Result<(), SmtpError> {
        if !self.helo_done {
            return self.send(HELO_REQD_RESP).await;
        }

        if self.inbox.is_none() {
            return self.send(AUTH_REQD_RESP).await;
        }

        if self.mail_from.is_empty() {
            return self.send(MAIL_FROM_REQD_RESP).await;
        }

        match parse::parse_email_args(args) {
            Ok((keyword, addr)) if keyword == "TO" => {
                self.rcpt_to.insert(addr);
                self.send(OK_RESP).await
            }
            _ => self.send(MISSING_ARGS_RESP).await,
        }
    }

    async fn handle_data(&mut self) -> Result<(), SmtpError> {
        if !self.helo_done {
            return self.send(HELO_REQD_RESP).await;
        }

        let Some(inbox_id) = self.inbox else {
            return self.send(AUTH_REQD_RESP).await;
        };

        if self.mail_from.is_empty() {
            return self.send(MAIL_FROM_REQD_RESP).await;
        }

        if self.rcpt_to.is_empty() {
            return self.send(RCPT_TO_REQD_RESP).await;
        }

        self.send(START_INPUT_RESP).await?;

        let mut buf: Vec<u8> = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = self.io.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                )
                .into());
            }

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            // Undo dot-stuffing.
            if line.first() == Some(&b'.') {
                line.remove(0);
            }

            if buf.len() + line.len() > self.max_msg_bytes {
                return self.send(MESSAGE_TOO_BIG_RESP).await;
            }

            buf.extend_from_slice(&line);
        }

        let email = self.build_email(buf, inbox_id);
        match store::save_email(&self.db, email).await {
            Ok(id) => {
                debug!("stored email {} for inbox {}", id, inbox_id);
                self.mail_from.clear();
                self.rcpt_to.clear();
                self.send(OK_RESP).await
            }
            Err(e) => {
                error!("failed to save email from {}: {}", self.peer, e);
                self.send(MAILBOX_FULL_RESP).await
            }
        }
    }

    /// Decompose one DATA payload into the record [`store::save_email`]
    /// persists. Never fails: an unparseable message is stored raw-only
    /// with the parse-error flag set.
    fn build_email(&self, data: Vec<u8>, inbox_id: i64) -> NewEmail {
        let (email, parse_error) = match message::decompose(&data) {
            Ok(email) => (email, false),
            Err(e) => {
                warn!("failed to parse email from {}: {}", self.peer, e);
                (DecomposedEmail::default(), true)
            }
        };

        // Serialized independently of the decompose outcome so a failure
        // here cannot be mistaken for a parse error.
        let headers_json = match serde_json::to_string(&email.headers) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize headers from {}: {}", self.peer, e);
                "{}".to_string()
            }
        };

        let mut addresses = Vec::new();
        for (kind, list) in [
            (AddressKind::From, &email.from),
            (AddressKind::To, &email.to),
            (AddressKind::Cc, &email.cc),
            (AddressKind::Bcc, &email.bcc),
        ] {
            for entry in list {
                addresses.push(NewAddress {
                    kind,
                    address: entry.address.clone(),
                    name: entry.name.clone(),
                });
            }
        }

        let mut contents = vec![NewContent {
            relationship: ContentKind::Raw,
            mime_type: "message/rfc822".to_string(),
            filename: String::new(),
            content: data,
        }];

        if let Some(text) = email.text {
            contents.push(NewContent {
                relationship: ContentKind::Text,
                mime_type: "text/plain".to_string(),
                filename: String::new(),
                content: text.into_bytes(),
            });
        }

        if let Some(html) = email.html {
            contents.push(NewContent {
                relationship: ContentKind::Html,
                mime_type: "text/html".to_string(),
                filename: String::new(),
                content: html.into_bytes(),
            });
        }

        for part in email.attachments {
            contents.push(NewContent {
                relationship: ContentKind::Attachment,
                mime_type: part.mime_type,
                filename: part.filename,
                content: part.data,
            });
        }

        for part in email.embedded {
            contents.push(NewContent {
                relationship: ContentKind::Embedded,
                mime_type: part.mime_type,
                filename: String::new(),
                content: part.data,
            });
        }

        NewEmail {
            inbox_id,
            client_addr: self.peer.to_string(),
            parse_error,
            mail_from: self.mail_from.clone(),
            subject: email.subject,
            headers_json,
            addresses,
            contents,
        }
    }

    async fn read_plain_creds(&mut self) -> Result<(String, String), SmtpError> {
        self.send(AUTH_PLAIN_CREDS_RESP).await?;
        let line = self.read_line().await?;
        parse::parse_plain_creds(&line)
    }

    async fn read_login_password(&mut self) -> Result<String, SmtpError> {
        self.send(AUTH_GET_PASS_RESP).await?;
        let line = self.read_line().await?;
        parse::decode_base64(&line)
    }

    async fn read_login_creds(&mut self) -> Result<(String, String), SmtpError> {
        self.send(AUTH_GET_USER_RESP).await?;
        let line = self.read_line().await?;
        let user = parse::decode_base64(&line)?;
        let pass = self.read_login_password().await?;
        Ok((user, pass))
    }

    async fn handle_auth(&mut self, args: &str) -> Result<(), SmtpError> {
        if !self.helo_done {
            return self.send(HELO_REQD_RESP).await;
        }

        let (mechanism, rest) = parse::parse_command(args);
        let creds = match mechanism.as_str() {
            "PLAIN" => {
                if rest.is_empty() {
                    self.read_plain_creds().await
                } else {
                    parse::parse_plain_creds(&rest)
                }
            }
            "LOGIN" => {
                if rest.is_empty() {
                    self.read_login_creds().await
                } else {
                    match parse::decode_base64(&rest) {
                        Ok(user) => self.read_login_password().await.map(|pass| (user, pass)),
                        Err(e) => Err(e),
                    }
                }
            }
            _ => return self.send(UNSUPPORTED_AUTH_RESP).await,
        };

        let (user, pass) = match creds {
            Ok(creds) => creds,
            Err(SmtpError::CredentialDecode) => return self.send(AUTH_FAILED_RESP).await,
            Err(e) => return Err(e),
        };

        let inbox = match store::inbox_by_name(&self.db, &user).await {
            Ok(Some(inbox)) => inbox,
            Ok(None) => {
                warn!("failed auth from {}: user {} not found", self.peer, user);
                return self.send(AUTH_FAILED_RESP).await;
            }
            Err(e) => {
                error!("failed to look up user {}: {}", user, e);
                return self.send(AUTH_FAILED_RESP).await;
            }
        };

        let verified = match self.hashers.verify_secret(&pass, &inbox.smtp_pass) {
            Ok(verified) => verified,
            Err(e) => {
                error!("failed to verify password for user {}: {}", user, e);
                false
            }
        };

        if !verified {
            warn!("failed auth from {}: invalid password for user {}", self.peer, user);
            return self.send(AUTH_FAILED_RESP).await;
        }

        self.inbox = Some(inbox.id);
        self.send(AUTH_SUCCESS_RESP).await
    }
}
