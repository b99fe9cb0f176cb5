use crate::config::Settings;
use crate::engine::MediaEngine;
use crate::sfu::SessionManager;
use crate::ws::connections::ConnectionRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: SessionManager,
    pub connections: Arc<ConnectionRegistry>,
}

impl AppState {
    pub fn new(settings: Settings, engine: Arc<dyn MediaEngine>) -> Self {
        let default_session = settings.default_session.as_ref().map(|d| d.id.clone());
        let manager = SessionManager::new(engine, settings.media.clone(), default_session);
        let connections = Arc::new(ConnectionRegistry::new());

        Self {
            settings: Arc::new(settings),
            manager,
            connections,
        }
    }
}
