//! Maven pull-through proxy server for quarry.
//!
//! This crate provides:
//! - The cache/proxy engine (single-flight upstream fetches, integrity checks)
//! - Upstream fetching over HTTP
//! - The HTTP request adapter (GET, HEAD, PUT on repository paths)
//! - Upload authentication against Argon2 password hashes
//! - The admin command console
//! - Unix socket and TCP listeners

pub mod auth;
pub mod console;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod index;
pub mod integrity;
pub mod metrics;
pub mod routes;
pub mod singleflight;
pub mod state;
pub mod transport;
pub mod upstream;

pub use auth::{AuthError, UserStore};
pub use console::Console;
pub use engine::{EngineConfig, ProxyEngine, ResolveError, ResolveResult};
pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, ServerState, Shutdown};
pub use upstream::{FetchOutcome, FetchedArtifact, Fetcher, HttpFetcher};
