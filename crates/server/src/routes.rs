//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Reserved routes live under `/-/`; a leading `-` segment never names
    // a Maven group.
    let mut router = Router::new().route("/-/health", get(handlers::health_check));

    if state.config.server.metrics_enabled {
        router = router.route("/-/metrics", get(metrics_handler));
    }

    router
        // Repository paths are arbitrary depth, so everything else lands here.
        .fallback(handlers::repository_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
