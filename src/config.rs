use crate::services::storage_service::DEFAULT_MAX_UPLOAD_BYTES;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub max_upload_bytes: u64,
    pub public_base_url: Option<String>,
}

/// What the binary should do after loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    CreateUser(String),
    LoadFixtures,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned, content-addressed document store API")]
pub struct Args {
    /// Host to bind to (overrides DOC_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DOC_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where version content is stored (overrides DOC_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DOC_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// SQLite pool size (overrides DOC_STORE_DB_MAX_CONNECTIONS)
    #[arg(long)]
    pub db_max_connections: Option<u32>,

    /// Largest accepted upload in bytes (overrides DOC_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Prefix for shareable links (overrides DOC_STORE_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long, conflicts_with_all = ["create_user", "load_fixtures"])]
    pub migrate: bool,

    /// Create a user, print its API token and exit
    #[arg(long, value_name = "EMAIL", conflicts_with = "load_fixtures")]
    pub create_user: Option<String>,

    /// Load the demo user and documents and exit
    #[arg(long)]
    pub load_fixtures: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("DOC_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("DOC_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("DOC_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/content".into());
        let env_db = env::var("DOC_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/doc_store.db".into());
        let env_pool = env_parse("DOC_STORE_DB_MAX_CONNECTIONS", 5u32)?;
        let env_max_upload = env_parse("DOC_STORE_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        let env_base_url = env::var("DOC_STORE_PUBLIC_BASE_URL").ok();

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            db_max_connections: args.db_max_connections.unwrap_or(env_pool),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            public_base_url: args
                .public_base_url
                .or(env_base_url)
                .filter(|url| !url.trim().is_empty()),
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if let Some(email) = args.create_user {
            RunMode::CreateUser(email)
        } else if args.load_fixtures {
            RunMode::LoadFixtures
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
