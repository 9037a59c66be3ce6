//! Database helpers: pool opening and migrations.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Open (creating if needed) the SQLite database under `dir` with WAL and
/// foreign keys enabled, and bring the schema up to date.
pub async fn open(dir: &Path) -> Result<SqlitePool, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(dir)?;

    let options = SqliteConnectOptions::new()
        .filename(dir.join("postdrop.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests. Limited to one connection, since every
/// `:memory:` connection is its own database.
pub async fn open_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Create tables if absent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS inboxes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            smtp_pass TEXT NOT NULL,
            api_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            inbox_id INTEGER NOT NULL REFERENCES inboxes(id) ON DELETE CASCADE,
            client_addr TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0,
            parse_error INTEGER NOT NULL DEFAULT 0,
            mail_from TEXT NOT NULL,
            subject TEXT NOT NULL,
            headers_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_emails_inbox_id ON emails(inbox_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS addresses (
            email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            address TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT ''
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_addresses_email_id ON addresses(email_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS email_contents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            relationship TEXT NOT NULL,
            content BLOB NOT NULL,
            mime_type TEXT NOT NULL,
            filename TEXT NOT NULL DEFAULT '',
            size INTEGER NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_email_contents_email_id ON email_contents(email_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
