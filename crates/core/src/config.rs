//! Configuration types shared across crates.

use crate::entry::UpstreamSource;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Server transport configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unix domain socket the repository is served on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after binding.
    /// Access control is delegated to these bits.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    /// Optional additional TCP bind address (e.g., "127.0.0.1:8080").
    #[serde(default)]
    pub bind: Option<String>,
    /// Largest accepted PUT body in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Enable the /-/metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("./maven.sock")
}

fn default_socket_mode() -> u32 {
    0o660
}

fn default_max_upload_size() -> u64 {
    crate::DEFAULT_MAX_UPLOAD_SIZE
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            bind: None,
            max_upload_size: default_max_upload_size(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.socket_mode > 0o777 {
            return Err(format!(
                "server.socket_mode must be a permission mask, got {:o}",
                self.socket_mode
            ));
        }
        if self.max_upload_size == 0 {
            return Err("server.max_upload_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Content store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the repository tree.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/repository")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Cache index persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// JSON file the index is persisted to. When unset the index is rebuilt
    /// by scanning the content store at every start.
    #[serde(default = "default_index_path")]
    pub path: Option<PathBuf>,
    /// Interval between background flushes of a modified index (0 disables).
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_index_path() -> Option<PathBuf> {
    Some(PathBuf::from("./data/index.json"))
}

fn default_flush_interval_secs() -> u64 {
    60
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl IndexConfig {
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }
}

/// Cache freshness configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long `maven-metadata*` and snapshot artifacts are served before
    /// being re-fetched.
    #[serde(default = "default_mutable_ttl_secs")]
    pub mutable_ttl_secs: u64,
}

fn default_mutable_ttl_secs() -> u64 {
    300 // 5 minutes
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mutable_ttl_secs: default_mutable_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn mutable_ttl(&self) -> time::Duration {
        let secs = i64::try_from(self.mutable_ttl_secs).unwrap_or(i64::MAX);
        time::Duration::seconds(secs)
    }
}

/// Upstream fetch behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-attempt timeout in seconds, covering the artifact and its sidecars.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Attempts per source before moving on after transient failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff between attempts; doubles on every retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Abort a fetch once no request is waiting for it.
    /// When false, abandoned fetches run to completion and warm the cache.
    #[serde(default)]
    pub cancel_unwatched: bool,
    /// Largest artifact accepted from an upstream, in bytes.
    #[serde(default = "default_max_artifact_size")]
    pub max_artifact_size: u64,
    /// User-Agent sent to upstreams.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_max_artifact_size() -> u64 {
    crate::DEFAULT_MAX_ARTIFACT_SIZE
}

fn default_user_agent() -> String {
    concat!("quarry/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            cancel_unwatched: false,
            max_artifact_size: default_max_artifact_size(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based), capped at 30 seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(30_000))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("fetch.max_attempts must be at least 1".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("fetch.timeout_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Trusted verification keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    /// File with one `name:base64` public key per line; `#` starts a comment.
    /// Re-read by the `keys reload` console command.
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    /// Inline public keys in `name:base64` form.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Upload credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// File with one `name:$argon2id$...` entry per line; `#` starts a
    /// comment. Rewritten by the `user add` and `user remove` console
    /// commands. Without it users live only as long as the process.
    #[serde(default)]
    pub users_file: Option<PathBuf>,
    /// Argon2 memory cost in KiB for newly hashed passwords.
    #[serde(default = "default_hash_memory_kib")]
    pub hash_memory_kib: u32,
    /// Argon2 iteration count for newly hashed passwords.
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,
    /// Password verifications allowed to run at once. Each one holds
    /// `hash_memory_kib` of memory while it runs.
    #[serde(default = "default_max_concurrent_verifications")]
    pub max_concurrent_verifications: usize,
    /// Remove a user whose valid credentials arrive with
    /// `X-Forwarded-Proto: http`, since the password crossed the network
    /// in the clear.
    #[serde(default = "default_revoke_on_plaintext")]
    pub revoke_on_plaintext: bool,
}

fn default_hash_memory_kib() -> u32 {
    19 * 1024
}

fn default_hash_iterations() -> u32 {
    2
}

fn default_max_concurrent_verifications() -> usize {
    4
}

fn default_revoke_on_plaintext() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            users_file: None,
            hash_memory_kib: default_hash_memory_kib(),
            hash_iterations: default_hash_iterations(),
            max_concurrent_verifications: default_max_concurrent_verifications(),
            revoke_on_plaintext: default_revoke_on_plaintext(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.hash_memory_kib < 8 {
            return Err("auth.hash_memory_kib must be at least 8".to_string());
        }
        if self.hash_iterations == 0 {
            return Err("auth.hash_iterations must be at least 1".to_string());
        }
        if self.max_concurrent_verifications == 0 {
            return Err("auth.max_concurrent_verifications must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Signing configuration for published artifacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Key name (e.g., "repo.example.com-1").
    pub key_name: String,
    /// Private key source.
    pub private_key: PrivateKeyConfig,
}

/// Private key source configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PrivateKeyConfig {
    /// Key stored in a file.
    File {
        /// Path to the private key file.
        path: PathBuf,
    },
    /// Key stored in environment variable.
    Env {
        /// Environment variable name.
        var: String,
    },
    /// Key provided directly as a value (NOT recommended for production).
    Value {
        /// The signing key in `name:base64` format.
        key: String,
    },
    /// Generate a new key (for development only).
    Generate,
}

/// Admin console channels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Read commands from standard input.
    #[serde(default = "default_console_stdin")]
    pub stdin: bool,
    /// Unix socket accepting console sessions.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    /// Permission bits applied to the control socket.
    #[serde(default = "default_control_socket_mode")]
    pub control_socket_mode: u32,
}

fn default_console_stdin() -> bool {
    true
}

fn default_control_socket_mode() -> u32 {
    0o600
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            stdin: default_console_stdin(),
            control_socket: None,
            control_socket_mode: default_control_socket_mode(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Upstream repositories, consulted in ascending priority.
    #[serde(default)]
    pub upstreams: Vec<UpstreamSource>,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Signing configuration (optional). Without it published artifacts
    /// carry no signature.
    pub signing: Option<SigningConfig>,
    #[serde(default)]
    pub console: ConsoleConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** No upstreams, no index file, console disabled.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            index: IndexConfig {
                path: None,
                flush_interval_secs: 0,
            },
            cache: CacheConfig::default(),
            fetch: FetchConfig {
                timeout_secs: 5,
                backoff_ms: 1,
                ..FetchConfig::default()
            },
            upstreams: Vec::new(),
            trust: TrustConfig::default(),
            auth: AuthConfig {
                hash_memory_kib: 64,
                hash_iterations: 1,
                ..AuthConfig::default()
            },
            signing: None,
            console: ConsoleConfig {
                stdin: false,
                ..ConsoleConfig::default()
            },
        }
    }

    /// Validate every section and the upstream list.
    pub fn validate(&self) -> crate::Result<()> {
        self.server.validate().map_err(crate::Error::Config)?;
        self.fetch.validate().map_err(crate::Error::Config)?;
        self.auth.validate().map_err(crate::Error::Config)?;

        let mut seen = HashSet::new();
        for source in &self.upstreams {
            source.validate()?;
            if !seen.insert(source.id.as_str()) {
                return Err(crate::Error::InvalidSource(format!(
                    "duplicate source id: {}",
                    source.id
                )));
            }
        }
        Ok(())
    }
}
