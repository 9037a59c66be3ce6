//! End-to-end SMTP sessions over raw sockets.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use postdrop::db;
use postdrop::secrets::HasherPool;
use postdrop::smtp::SmtpServer;
use postdrop::store;
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const USER: &str = "tester";
const PASSWORD: &str = "sesame-open";

async fn start_server(max_msg_bytes: usize) -> (SqlitePool, SocketAddr) {
    let pool = db::open_in_memory().await.expect("open memory db");
    let hashers = Arc::new(HasherPool::new());
    store::create_inbox(
        &pool,
        USER,
        &hashers.hash_secret(PASSWORD),
        &hashers.hash_secret("api-key"),
    )
    .await
    .expect("create inbox");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SmtpServer::new(pool.clone(), None, max_msg_bytes, hashers);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (pool, addr)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(read),
            writer,
        };
        let greeting = client.read_line().await;
        assert!(greeting.starts_with("220"), "greeting: {greeting}");
        client
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    /// Send a command and read a single reply line.
    async fn cmd(&mut self, line: &str) -> String {
        self.send_line(line).await;
        self.read_line().await
    }

    /// Send a command and read through a multi-line reply, returning its
    /// final line.
    async fn cmd_multi(&mut self, line: &str) -> String {
        self.send_line(line).await;
        loop {
            let reply = self.read_line().await;
            if reply.len() < 4 || reply.as_bytes()[3] != b'-' {
                return reply;
            }
        }
    }

    async fn auth_plain(&mut self, user: &str, pass: &str) -> String {
        let token = B64.encode(format!("\0{}\0{}", user, pass));
        self.cmd(&format!("AUTH PLAIN {}", token)).await
    }

    /// Greet and authenticate, panicking on failure.
    async fn login(&mut self) {
        assert!(self.cmd_multi("EHLO client.local").await.starts_with("250"));
        assert!(self.auth_plain(USER, PASSWORD).await.starts_with("235"));
    }
}

async fn email_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM emails")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn ordering_violations_are_rejected_and_store_nothing() {
    let (pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;

    // Anything before the greeting.
    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("503"));
    assert!(c.auth_plain(USER, PASSWORD).await.starts_with("503"));

    assert!(c.cmd_multi("EHLO client.local").await.starts_with("250"));

    // Envelope before authentication.
    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("530"));
    assert!(c.cmd("RCPT TO:<x@y.test>").await.starts_with("530"));
    assert!(c.cmd("DATA").await.starts_with("530"));

    assert!(c.auth_plain(USER, PASSWORD).await.starts_with("235"));

    // RCPT and DATA before MAIL.
    assert!(c.cmd("RCPT TO:<x@y.test>").await.starts_with("503"));
    assert!(c.cmd("DATA").await.starts_with("503"));

    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));

    // DATA before any RCPT.
    assert!(c.cmd("DATA").await.starts_with("503"));

    assert_eq!(email_count(&pool).await, 0);
}

#[tokio::test]
async fn ehlo_advertises_capabilities() {
    let (_pool, addr) = start_server(4096).await;
    let mut c = Client::connect(addr).await;

    c.send_line("EHLO client.local").await;
    let mut lines = Vec::new();
    loop {
        let reply = c.read_line().await;
        let done = reply.len() < 4 || reply.as_bytes()[3] != b'-';
        lines.push(reply);
        if done {
            break;
        }
    }

    let all = lines.concat();
    assert!(all.contains("250-SIZE 4096"));
    assert!(all.contains("250-AUTH PLAIN LOGIN"));
    assert!(all.contains("250-PIPELINING"));
    // No certificate configured, so no STARTTLS capability.
    assert!(!all.contains("STARTTLS"));
}

#[tokio::test]
async fn bad_arguments_are_rejected() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;

    assert!(c.cmd("HELO").await.starts_with("501"));
    assert!(c.cmd("HELO client.local").await.starts_with("250"));
    assert!(c.auth_plain(USER, PASSWORD).await.starts_with("235"));

    assert!(c.cmd("MAIL FROM:no-brackets@b.test").await.starts_with("501"));
    assert!(c.cmd("MAIL FROM:<no-at-sign>").await.starts_with("501"));
    assert!(c.cmd("MAIL TO:<a@b.test>").await.starts_with("501"));
    assert!(c.cmd("BOGUS").await.starts_with("502"));
}

#[tokio::test]
async fn auth_plain_failures_are_indistinguishable() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    assert!(c.cmd_multi("EHLO client.local").await.starts_with("250"));

    // Wrong password and unknown user look the same.
    assert!(c.auth_plain(USER, "wrong").await.starts_with("535"));
    assert!(c.auth_plain("nobody", PASSWORD).await.starts_with("535"));

    // Decode failures answer 535 and keep the connection usable.
    assert!(c.cmd("AUTH PLAIN !!!not-base64!!!").await.starts_with("535"));
    assert!(c.cmd("NOOP").await.starts_with("250"));

    // Unsupported mechanism.
    assert!(c.cmd("AUTH CRAM-MD5").await.starts_with("504"));

    // The right credentials still work afterwards.
    assert!(c.auth_plain(USER, PASSWORD).await.starts_with("235"));
}

#[tokio::test]
async fn auth_plain_prompt_flow() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    assert!(c.cmd_multi("EHLO client.local").await.starts_with("250"));

    let reply = c.cmd("AUTH PLAIN").await;
    assert!(reply.starts_with("334"), "credentials prompt: {reply}");
    let token = B64.encode(format!("\0{}\0{}", USER, PASSWORD));
    assert!(c.cmd(&token).await.starts_with("235"));
}

#[tokio::test]
async fn auth_login_prompt_flow() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    assert!(c.cmd_multi("EHLO client.local").await.starts_with("250"));

    let reply = c.cmd("AUTH LOGIN").await;
    assert!(reply.starts_with("334"), "username prompt: {reply}");
    let reply = c.cmd(&B64.encode(USER)).await;
    assert!(reply.starts_with("334"), "password prompt: {reply}");
    let reply = c.cmd(&B64.encode(PASSWORD)).await;
    assert!(reply.starts_with("235"), "auth result: {reply}");
}

#[tokio::test]
async fn auth_login_with_inline_username() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    assert!(c.cmd_multi("EHLO client.local").await.starts_with("250"));

    let reply = c.cmd(&format!("AUTH LOGIN {}", B64.encode(USER))).await;
    assert!(reply.starts_with("334"), "password prompt: {reply}");
    assert!(c.cmd(&B64.encode(PASSWORD)).await.starts_with("235"));

    // A bad inline username answers 535 without ending the session.
    let mut c = Client::connect(addr).await;
    assert!(c.cmd_multi("EHLO client.local").await.starts_with("250"));
    assert!(c.cmd("AUTH LOGIN ***").await.starts_with("535"));
    assert!(c.cmd("NOOP").await.starts_with("250"));
}

#[tokio::test]
async fn data_round_trip_decomposes_message() {
    let (pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    c.login().await;

    assert!(c.cmd("MAIL FROM:<alice@example.test>").await.starts_with("250"));
    assert!(c.cmd("RCPT TO:<tester@example.test>").await.starts_with("250"));
    // Duplicate recipients collapse.
    assert!(c.cmd("RCPT TO:<tester@example.test>").await.starts_with("250"));
    assert!(c.cmd("DATA").await.starts_with("354"));

    for line in [
        "From: Alice <alice@example.test>",
        "To: bob@example.test",
        "Cc: carol@example.test",
        "Subject: Kitchen sink",
        "MIME-Version: 1.0",
        "Content-Type: multipart/mixed; boundary=OUTER",
        "",
        "--OUTER",
        "Content-Type: multipart/alternative; boundary=INNER",
        "",
        "--INNER",
        "Content-Type: text/plain",
        "",
        "plain body",
        "..hello",
        "--INNER",
        "Content-Type: text/html",
        "",
        "<p>html body</p>",
        "--INNER--",
        "--OUTER",
        "Content-Type: application/pdf",
        "Content-Disposition: attachment; filename=\"report.pdf\"",
        "",
        "PDFDATA",
        "--OUTER",
        "Content-Type: image/png",
        "Content-ID: <logo@local>",
        "",
        "PNGDATA",
        "--OUTER--",
    ] {
        c.send_line(line).await;
    }
    assert!(c.cmd(".").await.starts_with("250"));

    assert_eq!(email_count(&pool).await, 1);
    let (id, subject, mail_from, is_read, parse_error): (i64, String, String, bool, bool) =
        sqlx::query_as("SELECT id, subject, mail_from, is_read, parse_error FROM emails")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(subject, "Kitchen sink");
    assert_eq!(mail_from, "alice@example.test");
    assert!(!is_read);
    assert!(!parse_error);

    // Exactly one row per relationship.
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT relationship, count(*) FROM email_contents WHERE email_id = ? GROUP BY relationship",
    )
    .bind(id)
    .fetch_all(&pool)
    .await
    .unwrap();
    for rel in ["raw", "text", "html", "attachment", "embedded"] {
        assert!(
            rows.iter().any(|(r, n)| r == rel && *n == 1),
            "expected one {rel} row, got {rows:?}"
        );
    }

    // Sizes are byte-accurate for every row.
    let contents: Vec<(String, Vec<u8>, i64)> =
        sqlx::query_as("SELECT relationship, content, size FROM email_contents WHERE email_id = ?")
            .bind(id)
            .fetch_all(&pool)
            .await
            .unwrap();
    for (rel, content, size) in &contents {
        assert_eq!(content.len() as i64, *size, "size mismatch for {rel}");
    }

    // Dot-stuffing was undone and the terminator never stored.
    let raw = &contents.iter().find(|(r, _, _)| r == "raw").unwrap().1;
    let raw = String::from_utf8(raw.clone()).unwrap();
    assert!(raw.contains("\r\n.hello\r\n"));
    assert!(!raw.contains("..hello"));
    assert!(!raw.ends_with("\r\n.\r\n"));

    // Address rows from the parsed headers.
    let addrs: Vec<(String, String, String)> =
        sqlx::query_as("SELECT kind, address, name FROM addresses WHERE email_id = ?")
            .bind(id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert!(addrs.iter().any(|(k, a, n)| k == "from"
        && a == "alice@example.test"
        && n == "Alice"));
    assert!(addrs.iter().any(|(k, a, _)| k == "to" && a == "bob@example.test"));
    assert!(addrs.iter().any(|(k, a, _)| k == "cc" && a == "carol@example.test"));
}

#[tokio::test]
async fn oversize_message_is_rejected() {
    let (pool, addr) = start_server(2048).await;
    let mut c = Client::connect(addr).await;
    c.login().await;

    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));
    assert!(c.cmd("RCPT TO:<x@y.test>").await.starts_with("250"));
    assert!(c.cmd("DATA").await.starts_with("354"));

    // One line over the limit aborts ingestion immediately.
    let reply = c.cmd(&"a".repeat(4096)).await;
    assert!(reply.starts_with("550"), "oversize reply: {reply}");

    // The connection is still usable.
    assert!(c.cmd("RSET").await.starts_with("250"));
    assert_eq!(email_count(&pool).await, 0);
}

#[tokio::test]
async fn malformed_message_is_stored_raw_with_parse_error() {
    let (pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    c.login().await;

    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));
    assert!(c.cmd("RCPT TO:<x@y.test>").await.starts_with("250"));
    assert!(c.cmd("DATA").await.starts_with("354"));
    // A header line with no colon makes the whole parse fail.
    c.send_line("this is not a valid header line").await;
    c.send_line("Subject: whatever").await;
    c.send_line("").await;
    c.send_line("body").await;
    assert!(c.cmd(".").await.starts_with("250"));

    let (parse_error,): (bool,) = sqlx::query_as("SELECT parse_error FROM emails")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(parse_error);

    // The raw row is always present.
    let raw: Vec<u8> =
        sqlx::query_scalar("SELECT content FROM email_contents WHERE relationship = 'raw'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(String::from_utf8_lossy(&raw).contains("body"));
}

#[tokio::test]
async fn rset_clears_authentication_and_envelope() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    c.login().await;

    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));
    assert!(c.cmd("RSET").await.starts_with("250"));

    // Authentication is gone, but the greeting survives.
    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("530"));
    assert!(c.auth_plain(USER, PASSWORD).await.starts_with("235"));
}

#[tokio::test]
async fn starttls_refused_without_certificate() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    c.login().await;

    assert!(c.cmd("STARTTLS").await.starts_with("502"));
    // The refusal changes nothing.
    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));
}

#[tokio::test]
async fn successful_data_resets_the_envelope() {
    let (_pool, addr) = start_server(1 << 20).await;
    let mut c = Client::connect(addr).await;
    c.login().await;

    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));
    assert!(c.cmd("RCPT TO:<x@y.test>").await.starts_with("250"));
    assert!(c.cmd("DATA").await.starts_with("354"));
    c.send_line("Subject: first").await;
    c.send_line("").await;
    c.send_line("hi").await;
    assert!(c.cmd(".").await.starts_with("250"));

    // The transaction is done; a new one needs a fresh envelope.
    assert!(c.cmd("DATA").await.starts_with("503"));
    // But authentication is preserved.
    assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));
}

#[tokio::test]
async fn concurrent_sessions_deliver_independently() {
    let (pool, addr) = start_server(1 << 20).await;

    async fn deliver(addr: SocketAddr, tag: &str) {
        let mut c = Client::connect(addr).await;
        c.login().await;
        assert!(c.cmd("MAIL FROM:<a@b.test>").await.starts_with("250"));
        assert!(c.cmd("RCPT TO:<x@y.test>").await.starts_with("250"));
        assert!(c.cmd("DATA").await.starts_with("354"));
        c.send_line(&format!("Subject: {tag}")).await;
        c.send_line("").await;
        c.send_line("hi").await;
        assert!(c.cmd(".").await.starts_with("250"));
        assert!(c.cmd("QUIT").await.starts_with("221"));
    }

    let first = tokio::spawn(deliver(addr, "one"));
    let second = tokio::spawn(deliver(addr, "two"));
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(email_count(&pool).await, 2);
}
