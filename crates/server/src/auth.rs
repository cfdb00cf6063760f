//! Upload authentication.
//!
//! Publishers authenticate with HTTP Basic credentials that are checked
//! against Argon2id password hashes. Users are kept in a copy-on-write map
//! and, when `auth.users_file` is set, persisted one `name:phc-hash` per line.

use crate::error::{ApiError, ApiResult};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::RwLock;
use quarry_core::config::AuthConfig;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

const MAX_USER_NAME_LEN: usize = 64;

/// Errors from loading or changing the user set.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid user entry on line {line}: {message}")]
    InvalidEntry { line: usize, message: String },

    #[error("invalid user name: {0:?}")]
    InvalidName(String),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("password hashing failed: {0}")]
    Hash(String),
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Credentials carried by an `Authorization: Basic` header.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A publisher whose credentials were accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub name: String,
}

/// Extract Basic credentials from the Authorization header.
/// Per RFC 7617 the scheme name is case-insensitive.
pub fn extract_basic_credentials(headers: &HeaderMap) -> ApiResult<BasicCredentials> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))?
        .to_str()
        .map_err(|_| ApiError::Unauthorized("malformed authorization header".to_string()))?;

    let encoded = match value.get(..6) {
        Some(scheme) if scheme.eq_ignore_ascii_case("basic ") => value[6..].trim(),
        _ => {
            return Err(ApiError::Unauthorized(
                "unsupported authorization scheme".to_string(),
            ));
        }
    };

    let malformed = || ApiError::Unauthorized("malformed credentials".to_string());
    let decoded = STANDARD.decode(encoded).map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (user, password) = decoded.split_once(':').ok_or_else(malformed)?;
    if user.is_empty() {
        return Err(malformed());
    }

    Ok(BasicCredentials {
        user: user.to_string(),
        password: password.to_string(),
    })
}

/// True when a fronting proxy reports the request arrived over plain HTTP.
fn forwarded_plaintext(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("http"))
}

/// Authenticate a publishing request.
///
/// Valid credentials that a proxy reports as sent over plain HTTP are
/// refused, and the user is removed when `auth.revoke_on_plaintext` is set.
pub async fn require_publisher(users: &UserStore, headers: &HeaderMap) -> ApiResult<AuthenticatedUser> {
    let credentials = extract_basic_credentials(headers)?;
    if !users.verify(&credentials.user, &credentials.password).await {
        warn!(user = %credentials.user, "Rejected upload credentials");
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }

    if users.config().revoke_on_plaintext && forwarded_plaintext(headers) {
        match users.remove(&credentials.user).await {
            Ok(_) => warn!(user = %credentials.user, "Credentials sent over plain HTTP, user removed"),
            Err(e) => error!(user = %credentials.user, error = %e, "Failed to remove exposed user"),
        }
        return Err(ApiError::Forbidden(
            "credentials were sent over plain HTTP and have been revoked; use HTTPS".to_string(),
        ));
    }

    Ok(AuthenticatedUser {
        name: credentials.user,
    })
}

fn hasher(config: &AuthConfig) -> AuthResult<Argon2<'static>> {
    let params = Params::new(config.hash_memory_kib, config.hash_iterations, 1, None)
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password into a PHC string with a fresh random salt.
pub fn hash_password(config: &AuthConfig, password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut rand_core::OsRng);
    hasher(config)?
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Check a password against a PHC string. Cost parameters come from the
/// string itself.
pub fn verify_password(phc: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn validate_name(name: &str) -> AuthResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_USER_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'));
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidName(name.to_string()))
    }
}

/// Parse a users file. Blank lines and `#` comments are skipped.
pub fn parse_users(content: &str) -> AuthResult<BTreeMap<String, String>> {
    let mut users = BTreeMap::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let invalid = |message: &str| AuthError::InvalidEntry {
            line: i + 1,
            message: message.to_string(),
        };

        let (name, hash) = line
            .split_once(':')
            .ok_or_else(|| invalid("expected name:hash"))?;
        validate_name(name).map_err(|_| invalid("invalid user name"))?;
        let parsed = PasswordHash::new(hash).map_err(|e| invalid(&e.to_string()))?;
        if !parsed.algorithm.as_str().starts_with("argon2") {
            return Err(invalid("not an argon2 hash"));
        }
        if users.insert(name.to_string(), hash.to_string()).is_some() {
            return Err(invalid("duplicate user"));
        }
    }
    Ok(users)
}

fn render_users(users: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# quarry upload users: name:argon2-hash\n");
    for (name, hash) in users {
        out.push_str(name);
        out.push(':');
        out.push_str(hash);
        out.push('\n');
    }
    out
}

/// The set of users allowed to publish.
pub struct UserStore {
    users: RwLock<Arc<BTreeMap<String, String>>>,
    config: AuthConfig,
    verifications: Arc<Semaphore>,
    writes: Mutex<()>,
}

impl UserStore {
    /// An empty store.
    pub fn new(config: AuthConfig) -> Self {
        Self::with_users(config, BTreeMap::new())
    }

    fn with_users(config: AuthConfig, users: BTreeMap<String, String>) -> Self {
        let permits = config.max_concurrent_verifications.max(1);
        Self {
            users: RwLock::new(Arc::new(users)),
            config,
            verifications: Arc::new(Semaphore::new(permits)),
            writes: Mutex::new(()),
        }
    }

    /// Load users from `auth.users_file`. A missing file is an empty set;
    /// `user add` creates it.
    pub async fn load(config: &AuthConfig) -> AuthResult<Self> {
        let users = match &config.users_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(content) => parse_users(&content)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "Users file does not exist yet");
                    BTreeMap::new()
                }
                Err(e) => return Err(e.into()),
            },
            None => BTreeMap::new(),
        };
        Ok(Self::with_users(config.clone(), users))
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Sorted user names.
    pub fn names(&self) -> Vec<String> {
        self.users.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.users.read().contains_key(name)
    }

    /// Check credentials. Hashing runs on the blocking pool, bounded by
    /// `auth.max_concurrent_verifications`.
    pub async fn verify(&self, name: &str, password: &str) -> bool {
        let hash = self.users.read().get(name).cloned();
        let Ok(permit) = self.verifications.clone().acquire_owned().await else {
            return false;
        };

        let config = self.config.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match hash {
                Some(hash) => verify_password(&hash, &password),
                None => {
                    // Unknown users cost as much as known ones.
                    let _ = hash_password(&config, &password);
                    false
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Add a user or replace their password. Returns true when an existing
    /// user was replaced.
    pub async fn add(&self, name: &str, password: &str) -> AuthResult<bool> {
        validate_name(name)?;
        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }

        let config = self.config.clone();
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&config, &password))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))??;

        let _writes = self.writes.lock().await;
        let mut next = self.users.read().as_ref().clone();
        let replaced = next.insert(name.to_string(), hash).is_some();
        self.persist(&next).await?;
        *self.users.write() = Arc::new(next);
        Ok(replaced)
    }

    /// Remove a user. Returns false when no such user existed.
    pub async fn remove(&self, name: &str) -> AuthResult<bool> {
        let _writes = self.writes.lock().await;
        let mut next = self.users.read().as_ref().clone();
        if next.remove(name).is_none() {
            return Ok(false);
        }
        self.persist(&next).await?;
        *self.users.write() = Arc::new(next);
        Ok(true)
    }

    /// Write `users` to the users file via a temporary file and rename.
    async fn persist(&self, users: &BTreeMap<String, String>) -> AuthResult<()> {
        let Some(path) = &self.config.users_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, render_users(users)).await?;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
