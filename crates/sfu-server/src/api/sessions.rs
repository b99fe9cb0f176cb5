use crate::error::Result;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use sfu_protocol::{SessionInfo, SessionListResponse};

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.manager.list_sessions().await,
    })
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>> {
    let session = state.manager.get(&id).await?;
    Ok(Json(session.info().await))
}
