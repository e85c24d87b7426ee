//! Session management handlers

use crate::error::{RelayError, Result};
use crate::process::CommandSpec;
use crate::server::AppState;
use crate::session::SessionSummary;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    sessions: Vec<SessionSummary>,
}

/// Either a program selector or an explicit command line
#[derive(Debug, Deserialize)]
pub struct ReplaceRequest {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

pub async fn list(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.registry.list().await,
    })
}

pub async fn replace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReplaceRequest>,
) -> Result<StatusCode> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| RelayError::SessionNotFound(id.clone()))?;

    let command = match (request.program, request.command) {
        (Some(selector), None) => state.registry.config().program(&selector)?.start,
        (None, Some(argv)) if !argv.is_empty() => {
            // Keep the environment of the program the session was created with
            let base = &session.program().start;
            CommandSpec {
                argv,
                working_dir: base.working_dir.clone(),
                env: base.env.clone(),
            }
        }
        _ => {
            return Err(RelayError::BadRequest(
                "expected exactly one of `program` or a non-empty `command`".to_string(),
            ))
        }
    };

    info!("Replace requested for session {}: `{}`", id, command.display());
    state.registry.replace_process(&id, command).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    info!("Delete requested for session {}", id);
    state.registry.teardown(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
