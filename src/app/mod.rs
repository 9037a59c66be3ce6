//! Application setup and runtime.

use serde::Deserialize;
use sqlx::SqlitePool;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crate::secrets::{self, HasherPool};
use crate::smtp::SmtpServer;
use crate::{db, http, store};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared application state for the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub hashers: Arc<HasherPool>,
}

/// Initialize pretty CLI logging.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .pretty()
        .init();
}

fn default_smtp_listen() -> String {
    "127.0.0.1:1025".to_string()
}

fn default_http_listen() -> String {
    "127.0.0.1:8025".to_string()
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("postdrop")
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_listen")]
    pub listen: String,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen: default_smtp_listen(),
            max_message_bytes: default_max_message_bytes(),
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn resolve_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load the TOML configuration. A missing file only errors when it was
/// named explicitly; relative certificate paths resolve next to the file.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, BoxError> {
    let (path, from_args) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("postdrop")
                .join("config.toml"),
            false,
        ),
    };

    let mut cfg: Config = match fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !from_args => Config::default(),
        Err(e) => return Err(format!("failed to read {}: {}", path.display(), e).into()),
    };

    if cfg.server.smtp.max_message_bytes < 1024 {
        return Err("server.smtp.max_message_bytes must be >= 1024".into());
    }

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(p) = cfg.server.smtp.cert_file.take() {
        cfg.server.smtp.cert_file = Some(resolve_path(base, p));
    }
    if let Some(p) = cfg.server.smtp.key_file.take() {
        cfg.server.smtp.key_file = Some(resolve_path(base, p));
    }

    Ok(cfg)
}

fn load_tls_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, BoxError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(fs::File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(fs::File::open(key_file)?))?
        .ok_or("no private key found in key file")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Create a usable inbox on a fresh database so the server is reachable
/// out of the box; the generated secret is logged once.
async fn ensure_default_inbox(pool: &SqlitePool, hashers: &HasherPool) -> Result<(), BoxError> {
    if !store::list_inboxes(pool).await?.is_empty() {
        return Ok(());
    }

    let secret = secrets::random_token();
    let hash = hashers.hash_secret(&secret);
    let inbox = store::create_inbox(pool, "postdrop-default", &hash, &hash).await?;
    info!(
        "Starting up for the first time. Created inbox {} with SMTP username: {}, API key/SMTP password: {}",
        inbox.id, inbox.name, secret
    );
    Ok(())
}

/// Start the SMTP and HTTP servers with the given configuration.
pub async fn run(cfg: Config) -> Result<(), BoxError> {
    // rustls 0.23+ requires an installed crypto provider; ignore the error
    // if one is already set.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pool = db::open(&cfg.database.path).await?;
    let hashers = Arc::new(HasherPool::new());
    ensure_default_inbox(&pool, &hashers).await?;

    let tls = match (&cfg.server.smtp.cert_file, &cfg.server.smtp.key_file) {
        (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
        (None, None) => None,
        _ => return Err("server.smtp.cert_file and key_file must be set together".into()),
    };

    let smtp_listener = tokio::net::TcpListener::bind(&cfg.server.smtp.listen).await?;
    let http_listener = tokio::net::TcpListener::bind(&cfg.server.http.listen).await?;
    info!("postdrop smtp listener: {}", cfg.server.smtp.listen);
    info!("postdrop api listener:  http://{}", cfg.server.http.listen);

    let server = SmtpServer::new(
        pool.clone(),
        tls,
        cfg.server.smtp.max_message_bytes,
        hashers.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = server.serve(smtp_listener).await {
            error!("smtp listener error: {}", e);
        }
    });

    let state = AppState { db: pool, hashers };
    let app = http::build_router(state);
    axum::serve(http_listener, app).await?;
    Ok(())
}
