//! Quarry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use quarry_core::config::{AppConfig, PrivateKeyConfig, SigningConfig};
use quarry_server::index::CacheIndex;
use quarry_server::{
    AppState, Console, EngineConfig, HttpFetcher, ProxyEngine, ServerState, UserStore,
    create_router, transport,
};
use quarry_signer::{ArtifactSigner, TrustedKeys};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Quarry - A local Maven pull-through cache
#[derive(Parser, Debug)]
#[command(name = "quarryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "QUARRY_CONFIG",
        default_value = "config/quarry.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Quarry v{}", env!("CARGO_PKG_VERSION"));

    // The file is optional; every setting has a default and env vars
    // override whatever the file says.
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!("No config file at {}, using defaults and environment", args.config);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("QUARRY_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    quarry_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let store = quarry_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    store
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(path = %config.storage.path.display(), "Content store ready");

    let trusted = TrustedKeys::load(&config.trust).context("failed to load trusted keys")?;
    tracing::info!(keys = trusted.len(), "Loaded trusted keys");

    let signer = match &config.signing {
        Some(signing) => Some(Arc::new(load_signer(signing).await?)),
        None => {
            tracing::info!("No signing key configured; published artifacts are unsigned");
            None
        }
    };

    let fetcher = HttpFetcher::new(&config.fetch).context("failed to build HTTP client")?;
    let users = UserStore::load(&config.auth)
        .await
        .context("failed to load upload users")?;
    if users.is_empty() {
        tracing::warn!("No upload users configured; PUT requests will be rejected until `user add` is run");
    } else {
        tracing::info!(users = users.len(), "Loaded upload users");
    }
    let server_state = Arc::new(ServerState::new(&config, trusted).with_users(users));
    for source in server_state.sources().iter() {
        tracing::info!(
            source = %source.id,
            url = %source.url,
            priority = source.priority,
            require_signature = source.require_signature,
            "Upstream source"
        );
    }

    let engine = ProxyEngine::new(
        server_state,
        store,
        Arc::new(fetcher),
        signer,
        EngineConfig::from_app(&config),
    );

    let persisted = match &config.index.path {
        Some(path) => CacheIndex::load(path)
            .await
            .with_context(|| format!("failed to read index file: {}", path.display()))?,
        None => Vec::new(),
    };
    engine
        .recover(persisted)
        .await
        .context("failed to recover cache index")?;

    let flusher = config
        .index
        .flush_interval()
        .filter(|_| config.index.path.is_some())
        .map(|interval| engine.spawn_index_flusher(interval));

    let state = AppState::new(config.clone(), engine.clone());
    let shutdown = state.shutdown.clone();
    tokio::spawn(transport::forward_signals(shutdown.clone()));

    let console = Console::new(engine.clone(), shutdown.clone());
    if config.console.stdin {
        console.spawn_stdin();
    }
    if let Some(path) = &config.console.control_socket {
        let (listener, owner) = transport::bind_unix_socket(path, config.console.control_socket_mode)
            .with_context(|| format!("failed to bind control socket: {}", path.display()))?;
        tracing::info!(path = %path.display(), "Console listening");
        tokio::spawn(console.clone().serve_control_socket(listener, owner));
    }

    let app = create_router(state);

    let (unix_listener, _) =
        transport::bind_unix_socket(&config.server.socket_path, config.server.socket_mode)
            .with_context(|| {
                format!(
                    "failed to bind socket: {}",
                    config.server.socket_path.display()
                )
            })?;
    tracing::info!(path = %config.server.socket_path.display(), "Listening on Unix socket");
    let mut servers = vec![tokio::spawn(transport::serve_unix(
        unix_listener,
        app.clone(),
        shutdown.clone(),
    ))];

    if let Some(bind) = &config.server.bind {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind to {bind}"))?;
        tracing::info!("Listening on {}", bind);
        servers.push(tokio::spawn(transport::serve_tcp(
            listener,
            app,
            shutdown.clone(),
        )));
    }

    shutdown.wait().await;
    tracing::info!("Shutting down");

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Listener failed"),
            Err(e) => tracing::error!(error = %e, "Listener task panicked"),
        }
    }

    if let Some(flusher) = flusher {
        flusher.abort();
    }
    match engine.flush_index().await {
        Ok(Some(count)) => tracing::info!(entries = count, "Wrote cache index"),
        Ok(None) => {}
        Err(e) => tracing::error!(error = %e, "Failed to write cache index"),
    }

    transport::remove_socket(&config.server.socket_path);
    if let Some(path) = &config.console.control_socket {
        transport::remove_socket(path);
    }
    Ok(())
}

/// Load the artifact signer from configuration.
async fn load_signer(config: &SigningConfig) -> Result<ArtifactSigner> {
    match &config.private_key {
        PrivateKeyConfig::File { path } => {
            let key_data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read key file: {}", path.display()))?;
            let signer = ArtifactSigner::from_secret_key(key_data.trim())
                .context("failed to parse signing key")?;
            tracing::info!("Loaded signing key: {}", signer.key_name());
            Ok(signer)
        }
        PrivateKeyConfig::Env { var } => {
            let key_data = std::env::var(var)
                .with_context(|| format!("signing key env var not set: {var}"))?;
            let signer = ArtifactSigner::from_secret_key(key_data.trim())
                .context("failed to parse signing key")?;
            tracing::info!("Loaded signing key from env: {}", signer.key_name());
            Ok(signer)
        }
        PrivateKeyConfig::Generate => {
            tracing::warn!("Generating ephemeral signing key (not suitable for production)");
            let signer = ArtifactSigner::generate(&config.key_name);
            tracing::info!("Generated signing key: {}", signer.key_name());
            tracing::info!("Public key: {}", signer.public_key_string());
            Ok(signer)
        }
        PrivateKeyConfig::Value { key } => {
            tracing::warn!("Using inline signing key (not recommended for production)");
            let signer = ArtifactSigner::from_secret_key(key.trim())
                .context("failed to parse signing key")?;
            tracing::info!("Loaded signing key: {}", signer.key_name());
            Ok(signer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn load_signer_from_env() {
        let signer = ArtifactSigner::generate("repo-test");
        let secret = signer.secret_key_string();
        let prev = std::env::var("QUARRY_TEST_SIGNING_KEY").ok();
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("QUARRY_TEST_SIGNING_KEY", &secret) };

        let config = SigningConfig {
            key_name: "repo-test".to_string(),
            private_key: PrivateKeyConfig::Env {
                var: "QUARRY_TEST_SIGNING_KEY".to_string(),
            },
        };

        let loaded = load_signer(&config).await.unwrap();
        assert_eq!(loaded.key_name(), "repo-test");

        // SAFETY: as above.
        unsafe {
            if let Some(value) = prev {
                std::env::set_var("QUARRY_TEST_SIGNING_KEY", value);
            } else {
                std::env::remove_var("QUARRY_TEST_SIGNING_KEY");
            }
        }
    }

    #[tokio::test]
    async fn load_signer_from_file() {
        let signer = ArtifactSigner::generate("repo-test");
        let temp = tempdir().unwrap();
        let key_path = temp.path().join("signing.key");
        tokio::fs::write(&key_path, format!("{}\n", signer.secret_key_string()))
            .await
            .unwrap();

        let config = SigningConfig {
            key_name: "repo-test".to_string(),
            private_key: PrivateKeyConfig::File { path: key_path },
        };

        let loaded = load_signer(&config).await.unwrap();
        assert_eq!(loaded.key_name(), "repo-test");
        assert_eq!(loaded.public_key_string(), signer.public_key_string());
    }

    #[tokio::test]
    async fn load_signer_generate() {
        let config = SigningConfig {
            key_name: "ephemeral".to_string(),
            private_key: PrivateKeyConfig::Generate,
        };

        let loaded = load_signer(&config).await.unwrap();
        assert_eq!(loaded.key_name(), "ephemeral");
    }

    #[tokio::test]
    async fn load_signer_from_value() {
        let signer = ArtifactSigner::generate("inline-test");
        let config = SigningConfig {
            key_name: "inline-test".to_string(),
            private_key: PrivateKeyConfig::Value {
                key: signer.secret_key_string(),
            },
        };

        let loaded = load_signer(&config).await.unwrap();
        assert_eq!(loaded.key_name(), "inline-test");
    }

    #[tokio::test]
    async fn load_signer_rejects_garbage() {
        let config = SigningConfig {
            key_name: "bad".to_string(),
            private_key: PrivateKeyConfig::Value {
                key: "not-a-key".to_string(),
            },
        };
        assert!(load_signer(&config).await.is_err());
    }
}
