//! Task observer endpoint.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AgentContext;
use crate::tasks::task::{Observer, ObserverEvent, Task};

#[derive(Deserialize)]
pub struct OutputQuery {
    pub task_id: Option<String>,
}

/// `GET /api/cmd/output?task_id=<id>`: attach to a task, starting it if this
/// is the first observer.
///
/// - `400 Bad Request`: `task_id` missing
/// - `404 Not Found`: no such task (checked before the upgrade)
pub async fn output_ws(
    State(ctx): State<AgentContext>,
    Query(query): Query<OutputQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let task_id = query
        .task_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Validation("missing task_id".into()))?;
    let task = ctx
        .registry
        .get(&task_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("task {task_id} not found")))?;

    Ok(ws.on_upgrade(move |socket| observe(socket, task, ctx)))
}

async fn observe(socket: WebSocket, task: Arc<Task>, ctx: AgentContext) {
    let (mut sink, mut stream) = socket.split();
    let (observer, mut events) = Observer::channel();

    // A start failure has already been delivered to the observer as a banner
    // and a terminal notice, so the loop below still reports it.
    if let Err(e) = task.attach(observer, &ctx.registry, &ctx.limiter).await {
        warn!(task_id = %task.id(), "observer attach: {e}");
    }
    debug!(task_id = %task.id(), command = %task.command(), "observer attached");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ObserverEvent::Line(line)) => {
                    if sink.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                }
                Some(ObserverEvent::Finished(outcome)) => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: outcome.notice().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => {
                    // Released without an outcome.
                    let frame = CloseFrame {
                        code: close_code::ERROR,
                        reason: "task output ended unexpectedly".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(task_id = %task.id(), "observer detached");
}
