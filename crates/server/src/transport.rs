//! Listeners: the primary Unix socket, an optional TCP address, and the
//! console control socket.

use crate::state::Shutdown;
use axum::Router;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};

/// Bind a Unix socket at `path`, replacing a stale socket file, and apply
/// `mode` to it.
///
/// Returns the listener and the uid that owns the socket file.
pub fn bind_unix_socket(path: &Path, mode: u32) -> io::Result<(UnixListener, u32)> {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    let owner = std::fs::metadata(path)?.uid();
    Ok((listener, owner))
}

/// Remove a socket file on exit. A missing file is not an error.
pub fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

/// Serve `app` on a Unix socket until shutdown.
pub async fn serve_unix(listener: UnixListener, app: Router, shutdown: Shutdown) -> io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

/// Serve `app` on a TCP listener until shutdown.
pub async fn serve_tcp(listener: TcpListener, app: Router, shutdown: Shutdown) -> io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

/// Trigger `shutdown` on Ctrl-C or SIGTERM.
pub async fn forward_signals(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.wait() => return,
    }
    shutdown.trigger();
}
