//! Script sessions: a WebSocket piped into `<shell> -s`.
//!
//! Sessions are ephemeral and never registered. Each one runs three units
//! through the [`UnitLimiter`](crate::limiter::UnitLimiter):
//!
//! 1. client → shell stdin, until `script.eof`, a close or a read error
//! 2. shell stdout → client, line by line
//! 3. shell stderr → client, line by line
//!
//! Once unit 1 ends, stdin is closed, the shell's exit is awaited and one
//! `script.exited` message is sent before the socket closes.
//!
//! ## Message types (client → server)
//!
//! | Frame  | Payload                                  | Effect                       |
//! |--------|------------------------------------------|------------------------------|
//! | text   | `{"type":"script.data","data":"..."}`    | write `data` (+ `\n`)        |
//! | text   | `{"type":"script.eof"}`                  | close stdin                  |
//! | binary | raw bytes                                | write bytes (+ `\n`)         |
//!
//! ## Message types (server → client)
//!
//! | Type             | Key fields                              |
//! |------------------|-----------------------------------------|
//! | `script.started` | `session_id`, `status`, `time`          |
//! | `script.stdout`  | `data`                                  |
//! | `script.stderr`  | `data`                                  |
//! | `script.exited`  | `session_id`, `code` or `error`         |
//! | `error`          | `code`, `message`                       |

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::shell::process;
use crate::state::AgentContext;

/// How long to wait for output readers after the shell exits.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "script.data")]
    Data { data: String },
    #[serde(rename = "script.eof")]
    Eof,
}

/// `GET /api/cmd/script`: WebSocket upgrade for a script session.
pub async fn script_ws(State(ctx): State<AgentContext>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, ctx))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_json(sink: &mut WsSink, msg: &Value) -> bool {
    sink.send(Message::Text(msg.to_string().into())).await.is_ok()
}

async fn run_session(socket: WebSocket, ctx: AgentContext) {
    let session_id = Uuid::new_v4().to_string();
    let (mut sink, stream) = socket.split();

    let spawned = process::resolve_shell(&ctx.config.shell.shell)
        .and_then(|shell| process::spawn_script_shell(&shell));
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            error!(%session_id, "script shell failed to start: {e}");
            send_json(
                &mut sink,
                &json!({"type": "error", "code": "SPAWN_FAILED", "message": e.to_string()}),
            )
            .await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    if !send_json(&mut sink, &started_message(&session_id)).await {
        return;
    }
    info!(%session_id, pid = ?child.id(), "script session started");

    let (tx, mut out_rx) = mpsc::channel::<Value>(256);

    let input = match child.stdin.take() {
        Some(stdin) => spawn_unit(&ctx, feed_stdin(stream, stdin, tx.clone())).await,
        None => None,
    };
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.extend(spawn_unit(&ctx, forward_lines(stdout, "script.stdout", tx.clone())).await);
    }
    if let Some(stderr) = child.stderr.take() {
        readers.extend(spawn_unit(&ctx, forward_lines(stderr, "script.stderr", tx.clone())).await);
    }
    drop(tx);

    let finish = finish_session(input, child, readers);
    tokio::pin!(finish);

    let mut client_gone = false;
    let status = loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                if !client_gone && !send_json(&mut sink, &msg).await {
                    client_gone = true;
                }
            }
            status = &mut finish => break status,
        }
    };

    if !client_gone {
        while let Ok(msg) = out_rx.try_recv() {
            if !send_json(&mut sink, &msg).await {
                break;
            }
        }
        let mut exited = status;
        exited["session_id"] = json!(session_id);
        send_json(&mut sink, &exited).await;
        let _ = sink.send(Message::Close(None)).await;
    }
    info!(%session_id, "script session finished");
}

async fn spawn_unit<F>(ctx: &AgentContext, unit: F) -> Option<JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match ctx.limiter.spawn(unit).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("cannot spawn script unit: {e}");
            None
        }
    }
}

/// Wait for the input unit, then the shell, then the output readers.
async fn finish_session(input: Option<JoinHandle<()>>, mut child: Child, readers: Vec<JoinHandle<()>>) -> Value {
    if let Some(input) = input {
        let _ = input.await;
    }
    // With no input unit stdin was never taken or already dropped.
    drop(child.stdin.take());

    let status = child.wait().await;
    if tokio::time::timeout(READER_DRAIN_GRACE, futures::future::join_all(readers))
        .await
        .is_err()
    {
        warn!("script output still open after exit");
    }

    match status {
        Ok(s) => match s.code() {
            Some(code) => json!({"type": "script.exited", "code": code}),
            None => json!({"type": "script.exited", "error": process::describe_exit(s)}),
        },
        Err(e) => json!({"type": "script.exited", "error": e.to_string()}),
    }
}

/// Unit 1: copy client frames into the shell's stdin.
async fn feed_stdin(mut stream: SplitStream<WebSocket>, mut stdin: ChildStdin, tx: mpsc::Sender<Value>) {
    while let Some(frame) = stream.next().await {
        let data = match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Data { data }) => data.into_bytes(),
                Ok(ClientMessage::Eof) => break,
                Err(e) => {
                    let _ = tx
                        .send(json!({
                            "type": "error",
                            "code": "INVALID_MESSAGE",
                            "message": format!("unrecognized script message: {e}"),
                        }))
                        .await;
                    continue;
                }
            },
            Ok(Message::Binary(bytes)) => bytes.to_vec(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if let Err(e) = stdin.write_all(&with_trailing_newline(data)).await {
            warn!("script stdin write failed: {e}");
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

/// Units 2 and 3: forward one output pipe as typed JSON lines.
async fn forward_lines<R>(stream: R, kind: &'static str, tx: mpsc::Sender<Value>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut scratch = Vec::new();
    while let Some(line) = process::next_line(&mut reader, &mut scratch).await {
        if tx.send(json!({"type": kind, "data": line})).await.is_err() {
            break;
        }
    }
}

fn with_trailing_newline(mut data: Vec<u8>) -> Vec<u8> {
    if data.last() != Some(&b'\n') {
        data.push(b'\n');
    }
    data
}

/// `script.started`, stamped with the agent's local time.
fn started_message(session_id: &str) -> Value {
    json!({
        "type": "script.started",
        "session_id": session_id,
        "status": "started",
        "time": chrono::Local::now().to_rfc3339(),
    })
}
