//! SFU signaling server library
//!
//! Exposes the server components for the binary, for tests and for embedding
//! with a different media engine.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::Result;
use engine::{MediaEngine, MediasoupEngine};
use std::sync::Arc;

/// Create and configure the server application on mediasoup workers
pub async fn create_app(settings: config::Settings) -> Result<(axum::Router, state::AppState)> {
    create_app_with_engine(settings, Arc::new(MediasoupEngine::new())).await
}

/// Create and configure the server application on `engine`
pub async fn create_app_with_engine(
    settings: config::Settings,
    engine: Arc<dyn MediaEngine>,
) -> Result<(axum::Router, state::AppState)> {
    let app_state = state::AppState::new(settings, engine);

    if let Some(default) = &app_state.settings.default_session {
        app_state
            .manager
            .get_or_create(&default.id, default.name.clone())
            .await?;
        tracing::info!("Default session {} ready", default.id);
    }

    app_state
        .connections
        .spawn_keepalive(app_state.settings.server.keepalive_interval());
    ws::spawn_event_relay(&app_state.manager, app_state.connections.clone());

    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
