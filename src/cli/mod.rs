//! Command-line interface: server startup and inbox management.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::io::Read;
use std::path::PathBuf;

use crate::app::{self, BoxError};
use crate::models::inbox::Inbox;
use crate::secrets::{self, HasherPool};
use crate::{db, store};

#[derive(Debug, Parser)]
#[command(name = "postdrop", version, about = "Disposable mail-capture server")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the SMTP and API servers.
    Server,
    /// Manage inboxes.
    #[command(subcommand)]
    Inbox(InboxCommand),
}

#[derive(Debug, Subcommand)]
pub enum InboxCommand {
    /// Add an inbox.
    #[command(alias = "create")]
    Add {
        name: String,
        #[command(flatten)]
        creds: CredentialArgs,
    },
    /// List inboxes with their email counts.
    List,
    /// Delete an inbox and everything in it.
    Delete { name: String },
    /// Rotate an inbox's SMTP password and API key.
    Rotate {
        name: String,
        #[command(flatten)]
        creds: CredentialArgs,
    },
    /// Delete all of an inbox's emails.
    Clean { name: String },
}

#[derive(Debug, Args)]
pub struct CredentialArgs {
    /// Use credentials from a JSON file instead of generating them
    /// (`-` reads stdin).
    #[arg(short = 'f', long = "credential-file")]
    pub credential_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialConfig {
    smtp_pass: String,
    api_key: String,
}

pub async fn run() -> Result<(), BoxError> {
    let cli = Cli::parse();
    app::init_tracing();
    let cfg = app::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Server => app::run(cfg).await,
        Command::Inbox(cmd) => run_inbox_command(&cfg, cmd).await,
    }
}

async fn run_inbox_command(cfg: &app::Config, cmd: InboxCommand) -> Result<(), BoxError> {
    let pool = db::open(&cfg.database.path).await?;
    let hashers = HasherPool::new();

    match cmd {
        InboxCommand::Add { name, creds } => {
            if store::inbox_by_name(&pool, &name).await?.is_some() {
                return Err(format!("inbox {} already exists", name).into());
            }

            let generated = creds.credential_file.is_none();
            let new = new_credentials(creds.credential_file.as_deref())?;
            let inbox = store::create_inbox(
                &pool,
                &name,
                &hashers.hash_secret(&new.smtp_pass),
                &hashers.hash_secret(&new.api_key),
            )
            .await?;

            print_credentials(&inbox, &new, generated);
            Ok(())
        }
        InboxCommand::List => {
            for inbox in store::list_inboxes(&pool).await? {
                let count = store::count_emails(&pool, inbox.id).await?;
                println!("{}\t{}\t{} emails", inbox.id, inbox.name, count);
            }
            Ok(())
        }
        InboxCommand::Delete { name } => {
            let inbox = require_inbox(&pool, &name).await?;
            store::delete_inbox(&pool, inbox.id).await?;
            println!("Deleted inbox {}", name);
            Ok(())
        }
        InboxCommand::Rotate { name, creds } => {
            let inbox = require_inbox(&pool, &name).await?;
            let generated = creds.credential_file.is_none();
            let new = new_credentials(creds.credential_file.as_deref())?;
            store::rotate_inbox_secrets(
                &pool,
                inbox.id,
                &hashers.hash_secret(&new.smtp_pass),
                &hashers.hash_secret(&new.api_key),
            )
            .await?;

            print_credentials(&inbox, &new, generated);
            Ok(())
        }
        InboxCommand::Clean { name } => {
            let inbox = require_inbox(&pool, &name).await?;
            let removed = store::clean_inbox(&pool, inbox.id).await?;
            println!("Removed {} emails from inbox {}", removed, name);
            Ok(())
        }
    }
}

async fn require_inbox(pool: &SqlitePool, name: &str) -> Result<Inbox, BoxError> {
    match store::inbox_by_name(pool, name).await? {
        Some(inbox) => Ok(inbox),
        None => Err(format!("inbox {} not found", name).into()),
    }
}

fn new_credentials(file: Option<&str>) -> Result<CredentialConfig, BoxError> {
    let Some(file) = file else {
        return Ok(CredentialConfig {
            smtp_pass: secrets::random_token(),
            api_key: secrets::random_token(),
        });
    };

    let data = if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(file)?
    };

    let creds: CredentialConfig = serde_json::from_str(&data)?;
    if creds.smtp_pass.is_empty() || creds.api_key.is_empty() {
        return Err(format!("credentials file {} has empty values", file).into());
    }

    Ok(creds)
}

fn print_credentials(inbox: &Inbox, creds: &CredentialConfig, generated: bool) {
    println!("Inbox ID: {}", inbox.id);
    println!("SMTP username: {}", inbox.name);
    if generated {
        println!("SMTP password: {}", creds.smtp_pass);
        println!("API key: {}", creds.api_key);
    }
}
