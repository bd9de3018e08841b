use anyhow::{Context, Result};
use credvault::api::{create_router, TokenAppState};
use credvault::auth::CallerRegistry;
use credvault::config::CredvaultConfig;
use credvault::credentials::{CredentialLifecycleManager, SqliteCredentialStore};
use credvault::refresh::HttpTokenRefresher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credvault=info".into()),
        )
        .init();

    info!("Credvault starting...");

    let config = CredvaultConfig::load().context("Failed to load configuration")?;

    info!(
        bind_addr = %config.server.bind_addr,
        database_path = %config.storage.database_path,
        key_id = %config.crypto.key_id,
        callers = config.auth.callers.len(),
        "Configuration loaded"
    );

    let crypto = Arc::new(
        config
            .build_crypto_engine(|name| std::env::var(name).ok())
            .context("Failed to initialize crypto engine")?,
    );

    // Derive the active key up front so the first request does not pay for
    // the KDF and a bad configuration fails at startup
    let warm = Arc::clone(&crypto);
    tokio::task::spawn_blocking(move || warm.derive_key().map(|_| ()))
        .await
        .context("Key derivation task failed")?
        .context("Failed to derive encryption key")?;
    info!(key_id = %crypto.key_id(), "Encryption key ready");

    let store = Arc::new(
        SqliteCredentialStore::new(&config.storage.database_path)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let refresher = Arc::new(
        HttpTokenRefresher::new(
            Duration::from_secs(config.refresh.timeout_seconds),
            &config.refresh.token_urls,
        )
        .context("Failed to initialize token refresher")?,
    );

    let manager = Arc::new(CredentialLifecycleManager::new(
        Arc::clone(&crypto),
        store,
        refresher,
        config.rotation,
        config.timeouts(),
    ));

    let callers = Arc::new(CallerRegistry::new(config.auth.callers.clone()));
    if callers.is_empty() {
        warn!("No [[auth.callers]] configured; every /api/tokens request will be rejected");
    }

    let router = create_router(TokenAppState {
        manager,
        crypto,
        callers,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "Credvault API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("API server error")?;

    info!("Credvault stopped");
    Ok(())
}
