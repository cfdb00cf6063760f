//! Server test utilities.

use super::fetcher::ScriptedFetcher;
use quarry_core::UpstreamSource;
use quarry_core::config::AppConfig;
use quarry_server::{
    AppState, Console, EngineConfig, Fetcher, ProxyEngine, ServerState, create_router,
};
use quarry_signer::{ArtifactSigner, TrustedKeys};
use quarry_storage::{ContentStore, FilesystemBackend};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use tempfile::TempDir;

/// Every test server accepts uploads from this user.
#[allow(dead_code)]
pub const PUBLISHER: &str = "deployer";
#[allow(dead_code)]
pub const PUBLISHER_PASSWORD: &str = "s3cret-deploy";

/// `Authorization` header value for Basic credentials.
#[allow(dead_code)]
pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

/// `Authorization` header value for [`PUBLISHER`].
#[allow(dead_code)]
pub fn publisher_auth() -> String {
    basic_auth(PUBLISHER, PUBLISHER_PASSWORD)
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub engine: ProxyEngine,
    pub fetcher: Arc<ScriptedFetcher>,
    pub store: Arc<dyn ContentStore>,
    pub console: Console,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// A server with no upstream sources.
    pub async fn new() -> Self {
        Self::builder().build().await
    }

    /// A server with one unsigned upstream named `central`.
    pub async fn with_central() -> Self {
        Self::builder()
            .source(UpstreamSource::new("central", "https://repo.example.org/maven2"))
            .build()
            .await
    }

    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            config: AppConfig::for_testing(),
            trusted: TrustedKeys::default(),
            signer: None,
            temp_dir: None,
        }
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Tear down the server but keep its directory, to restart on it.
    pub fn into_temp_dir(self) -> TempDir {
        self.temp_dir
    }
}

/// Builder for [`TestServer`].
#[allow(dead_code)]
pub struct TestServerBuilder {
    config: AppConfig,
    trusted: TrustedKeys,
    signer: Option<ArtifactSigner>,
    temp_dir: Option<TempDir>,
}

#[allow(dead_code)]
impl TestServerBuilder {
    pub fn source(mut self, source: UpstreamSource) -> Self {
        self.config.upstreams.push(source);
        self
    }

    /// Trust signatures made by `signer`.
    pub fn trust(mut self, signer: &ArtifactSigner) -> Self {
        self.trusted
            .insert(signer.key_name(), signer.public_key().clone())
            .expect("Failed to trust key");
        self
    }

    /// Sign published artifacts with `signer`.
    pub fn signer(mut self, signer: ArtifactSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn configure<F>(mut self, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        modifier(&mut self.config);
        self
    }

    /// Reuse the storage and index of an earlier server.
    pub fn in_dir(mut self, temp_dir: TempDir) -> Self {
        self.temp_dir = Some(temp_dir);
        self
    }

    pub async fn build(mut self) -> TestServer {
        let temp_dir = match self.temp_dir {
            Some(dir) => dir,
            None => tempfile::tempdir().expect("Failed to create temp directory"),
        };

        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        self.config.storage.path = storage_path.clone();

        let store: Arc<dyn ContentStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let fetcher = Arc::new(ScriptedFetcher::new());
        let server_state = Arc::new(ServerState::new(&self.config, self.trusted));
        server_state
            .users()
            .add(PUBLISHER, PUBLISHER_PASSWORD)
            .await
            .expect("Failed to add publisher");
        let engine = ProxyEngine::new(
            server_state,
            store.clone(),
            fetcher.clone() as Arc<dyn Fetcher>,
            self.signer.map(Arc::new),
            EngineConfig::from_app(&self.config),
        );

        let state = AppState::new(self.config, engine.clone());
        let console = Console::new(engine.clone(), state.shutdown.clone());
        let router = create_router(state.clone());

        TestServer {
            router,
            state,
            engine,
            fetcher,
            store,
            console,
            temp_dir,
        }
    }
}
