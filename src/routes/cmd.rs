//! Command task endpoints.
//!
//! - `POST /api/cmd`: register a command as a new task
//! - `GET /api/cmd/ids`: list outstanding task ids
//!
//! Submitting does not run anything; the process starts when the first
//! observer attaches to `GET /api/cmd/output`.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AgentContext;
use crate::tasks::task::Task;

/// Request body for `POST /api/cmd`.
#[derive(Deserialize)]
pub struct SubmitRequest {
    /// Command line passed to `<shell> -c`.
    pub cmd: String,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

/// First configured forbidden substring contained in `cmd`. Empty entries
/// never match.
pub fn forbidden_match<'a>(cmd: &str, forbidden: &'a [String]) -> Option<&'a str> {
    forbidden
        .iter()
        .map(String::as_str)
        .find(|f| !f.is_empty() && cmd.contains(f))
}

/// `POST /api/cmd`: create a task for `cmd`.
///
/// # Errors
///
/// - `400 Bad Request`: body is not `{"cmd": string}`
/// - `403 Forbidden`: command contains a forbidden substring
/// - `429 Too Many Requests`: task registry is full
/// - `500 Internal Server Error`: the shell cannot be prepared
pub async fn submit(
    State(ctx): State<AgentContext>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Validation(format!("invalid request body: {}", e.body_text())))?;

    if let Some(hit) = forbidden_match(&req.cmd, &ctx.config.tasks.forbidden) {
        warn!(forbidden = hit, "rejected forbidden command");
        return Err(ApiError::Forbidden(
            "command contains a forbidden pattern".into(),
        ));
    }

    let task_id = Uuid::new_v4().to_string();
    let task = Task::create(task_id.clone(), req.cmd, &ctx.config.shell.shell)?;
    ctx.registry.set(&task_id, Arc::new(task)).await?;

    info!(%task_id, "task submitted");
    Ok(Json(SubmitResponse { task_id }))
}

#[derive(Deserialize)]
pub struct IdsQuery {
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct IdsResponse {
    /// The `name` the request was routed by, when it came through a proxy.
    pub target: Option<String>,
    pub tasks: Vec<String>,
}

/// `GET /api/cmd/ids`: snapshot of outstanding task ids.
pub async fn ids(
    State(ctx): State<AgentContext>,
    Query(query): Query<IdsQuery>,
) -> Json<IdsResponse> {
    Json(IdsResponse {
        target: query.name,
        tasks: ctx.registry.all().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_forbidden_is_substring_match() {
        let forbidden = list(&["rm -rf", "shutdown"]);
        assert_eq!(forbidden_match("sudo rm -rf /", &forbidden), Some("rm -rf"));
        assert_eq!(forbidden_match("echo shutdown now", &forbidden), Some("shutdown"));
        assert_eq!(forbidden_match("ls -la", &forbidden), None);
    }

    #[test]
    fn test_empty_forbidden_entry_never_matches() {
        assert_eq!(forbidden_match("anything", &list(&[""])), None);
        assert_eq!(forbidden_match("anything", &[]), None);
    }
}
