use anyhow::Result;
use doc_store::{
    app,
    config::{AppConfig, RunMode},
    db, fixtures,
    services::{content_store::FsContentStore, storage_service::StorageService},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting doc-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    tracing::debug!("Connecting to {}", db_url);
    let pool = Arc::new(db::connect(db_url, cfg.db_max_connections).await?);

    // --- Handle one-shot modes ---
    if mode == RunMode::Migrate {
        let applied = db::run_migrations(&pool).await?;
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(()); // exit after migration
    }

    let storage = StorageService::new(
        pool.clone(),
        Arc::new(FsContentStore::new(cfg.storage_dir.clone())),
    )
    .with_max_upload_bytes(cfg.max_upload_bytes)
    .with_public_base_url(cfg.public_base_url.clone());

    match mode {
        RunMode::CreateUser(email) => {
            let (user, token) = storage.access.create_user(&email).await?;
            tracing::info!(user_id = %user.id, email = %user.email, "created user");
            println!("{}", token);
            return Ok(());
        }
        RunMode::LoadFixtures => {
            let report = fixtures::load_fixtures(&storage).await?;
            if let Some(token) = report.token {
                println!("{} {}", report.owner.email, token);
            }
            return Ok(());
        }
        RunMode::Migrate | RunMode::Serve => {}
    }

    // --- Build router ---
    let app = app(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
