//! Session manager
//!
//! Maps session ids to [`Session`]s. Creates the engine worker and router for
//! each session and watches the engine's close notifications for it.
//!
//! Also tracks which connections work in which session. A session other than
//! the default one is closed when the last of its connections goes away.

use super::Session;
use crate::config::MediaSettings;
use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{Result, SignalError};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sfu_protocol::SessionInfo;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

const SESSION_ID_LEN: usize = 32;
const EVENT_CAPACITY: usize = 64;
const LAST_CONNECTION_CLOSED: &str = "last connection closed";

/// Session lifecycle changes, fanned out to every interested connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    SessionCreated { id: String, name: String },
    SessionClosed { id: String, reason: String },
}

struct ManagerInner {
    engine: Arc<dyn MediaEngine>,
    media: MediaSettings,
    default_session: Option<String>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Connections that have sent requests into each session
    members: RwLock<HashMap<String, HashSet<Uuid>>>,
    events: broadcast::Sender<ManagerEvent>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

fn random_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        media: MediaSettings,
        default_session: Option<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                engine,
                media,
                default_session,
                sessions: RwLock::new(HashMap::new()),
                members: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn media(&self) -> &MediaSettings {
        &self.inner.media
    }

    pub fn default_session_id(&self) -> Option<&str> {
        self.inner.default_session.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Create a session under a fresh random id
    pub async fn create_session(&self, name: Option<String>) -> Result<Arc<Session>> {
        loop {
            let id = random_session_id();
            match self.create_session_with_id(&id, name.clone()).await {
                Err(SignalError::SessionExists(_)) => continue,
                other => return other,
            }
        }
    }

    pub async fn create_session_with_id(&self, id: &str, name: Option<String>) -> Result<Arc<Session>> {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(id) {
            return Err(SignalError::SessionExists(id.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = self
            .inner
            .engine
            .create_worker(&self.inner.media.worker, tx)
            .await?;
        let router = match worker.create_router(&self.inner.media.codecs).await {
            Ok(router) => router,
            Err(e) => {
                worker.close();
                return Err(e.into());
            }
        };

        let name = name.unwrap_or_else(|| id.to_string());
        let session = Arc::new(Session::new(id.to_string(), name.clone(), worker, router));
        sessions.insert(id.to_string(), session.clone());
        drop(sessions);

        self.spawn_watcher(&session, rx);

        tracing::info!("Session {} ({}) created", id, name);
        let _ = self.inner.events.send(ManagerEvent::SessionCreated {
            id: id.to_string(),
            name,
        });

        Ok(session)
    }

    /// Return the session with `id`, creating it (named after its id) if absent
    pub async fn get_or_create(&self, id: &str, name: Option<String>) -> Result<Arc<Session>> {
        if let Ok(session) = self.get(id).await {
            return Ok(session);
        }
        match self.create_session_with_id(id, name).await {
            Err(SignalError::SessionExists(_)) => self.get(id).await,
            other => other,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SignalError::SessionNotFound(id.to_string()))
    }

    /// Look up the session a request targets; no id means the default session
    pub async fn resolve(&self, id: Option<&str>) -> Result<Arc<Session>> {
        match id.or(self.default_session_id()) {
            Some(id) => self.get(id).await,
            None => Err(SignalError::SessionNotFound(
                "(no session id and no default session)".to_string(),
            )),
        }
    }

    /// Close and forget a session; absent ids are a no-op
    pub async fn remove_session(&self, id: &str) -> bool {
        self.close_session(id, "destroyed").await
    }

    async fn close_session(&self, id: &str, reason: &str) -> bool {
        self.inner.members.write().await.remove(id);
        let Some(session) = self.inner.sessions.write().await.remove(id) else {
            tracing::debug!("Session {} already gone", id);
            return false;
        };

        session.close().await;
        let _ = self.inner.events.send(ManagerEvent::SessionClosed {
            id: id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    /// Record that `connection` works in session `id`
    pub async fn attach(&self, id: &str, connection: Uuid) {
        self.inner
            .members
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .insert(connection);
    }

    pub async fn members(&self, id: &str) -> Vec<Uuid> {
        self.inner
            .members
            .read()
            .await
            .get(id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forget `connection` in every session. Sessions it was the last member
    /// of are closed, except the default session; their ids are returned.
    pub async fn detach(&self, connection: Uuid) -> Vec<String> {
        let orphaned: Vec<String> = {
            let mut members = self.inner.members.write().await;
            let mut orphaned = Vec::new();
            members.retain(|id, connections| {
                if connections.remove(&connection) && connections.is_empty() {
                    orphaned.push(id.clone());
                    return false;
                }
                true
            });
            orphaned
        };

        let mut closed = Vec::new();
        for id in orphaned {
            if self.default_session_id() == Some(id.as_str()) {
                continue;
            }
            if self.close_session(&id, LAST_CONNECTION_CLOSED).await {
                closed.push(id);
            }
        }
        closed
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> =
            self.inner.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Close every session, used on server shutdown
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.close_session(&id, "shutdown").await;
        }
    }

    fn spawn_watcher(&self, session: &Arc<Session>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        let session: Weak<Session> = Arc::downgrade(session);
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(current) = session.upgrade() else {
                    break;
                };

                if let EngineEvent::WorkerDied { reason } = &event {
                    tracing::error!("Session {}: engine worker died: {}", current.id(), reason);
                    if let Some(inner) = manager.upgrade() {
                        SessionManager { inner }
                            .close_session(current.id(), &format!("worker died: {}", reason))
                            .await;
                    }
                    break;
                }

                current.on_engine_event(&event).await;
            }
        });
    }
}
