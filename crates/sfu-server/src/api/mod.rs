mod sessions;

use crate::state::AppState;
use crate::ws;
use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Session inspection
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/{id}", get(sessions::get_session))
        // WebSocket signaling endpoint
        .route(&state.settings.server.ws_path, get(ws::handler::ws_handler));

    // Demo pages and other static assets
    let router = match &state.settings.server.static_dir {
        Some(dir) => {
            tracing::info!("Serving static files from {}", dir);
            router.fallback_service(ServeDir::new(dir))
        }
        None => router,
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
