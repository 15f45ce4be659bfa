//! Agent and proxy on ephemeral ports, driven over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use cmder::config::{AuthConfig, ShellConfig, TargetConfig, TasksConfig, SECURITY_KEY_HEADER};
use cmder::tasks::task::SUCCESS_BANNER;
use cmder::{agent_router, proxy_router, AgentConfig, AgentContext, ProxyConfig, ProxyContext};

const KEY: &str = "e2e-key";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Stack {
    agent: SocketAddr,
    proxy: SocketAddr,
    http: Client<HttpConnector, Full<Bytes>>,
}

async fn serve(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn auth() -> AuthConfig {
    AuthConfig {
        security_key: KEY.into(),
        whitelist: vec!["127.0.0.1".into(), "::1".into()],
        access_window: None,
    }
}

async fn start() -> Stack {
    let agent = serve(agent_router(AgentContext::new(AgentConfig {
        auth: auth(),
        tasks: TasksConfig {
            capacity: 4,
            unit_multiplier: 4,
            forbidden: vec!["shutdown".into()],
        },
        shell: ShellConfig { shell: "sh".into() },
        ..AgentConfig::default()
    })))
    .await;

    let proxy = serve(proxy_router(ProxyContext::new(ProxyConfig {
        auth: auth(),
        targets: vec![TargetConfig {
            name: "local".into(),
            address: format!("http://{agent}"),
        }],
        ..ProxyConfig::default()
    })))
    .await;

    Stack {
        agent,
        proxy,
        http: Client::builder(TokioExecutor::new()).build_http(),
    }
}

async fn call(
    stack: &Stack,
    method: Method,
    url: &str,
    key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Bytes) {
    let mut builder = Request::builder().method(method).uri(url);
    if let Some(key) = key {
        builder = builder.header(SECURITY_KEY_HEADER, key);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Full::new(Bytes::from(v.to_string()))
        }
        None => Full::new(Bytes::new()),
    };
    let resp = stack.http.request(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, bytes)
}

async fn submit(stack: &Stack, base: &str, key: Option<&str>, cmd: &str) -> String {
    let (status, body) = call(stack, Method::POST, base, key, Some(json!({ "cmd": cmd }))).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let v: Value = serde_json::from_slice(&body).unwrap();
    v["task_id"].as_str().unwrap().to_string()
}

async fn open_ws(url: &str, key: Option<&str>) -> Result<Ws, tungstenite::Error> {
    let mut req = url.into_client_request()?;
    if let Some(key) = key {
        req.headers_mut()
            .insert(SECURITY_KEY_HEADER, key.parse().unwrap());
    }
    tokio_tungstenite::connect_async(req).await.map(|(ws, _)| ws)
}

/// Text frames until the server closes, plus the close reason.
async fn observe(mut ws: Ws) -> (Vec<String>, Option<String>) {
    let read = async {
        let mut lines = Vec::new();
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(t)) => lines.push(t.as_str().to_owned()),
                Ok(Message::Close(frame)) => {
                    return (lines, frame.map(|f| f.reason.as_str().to_owned()));
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        (lines, None)
    };
    tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("server never closed the observer")
}

async fn wait_until_gone(stack: &Stack, ids_url: &str, key: Option<&str>, task_id: &str) {
    for _ in 0..100 {
        let (_, body) = call(stack, Method::GET, ids_url, key, None).await;
        let v: Value = serde_json::from_slice(&body).unwrap();
        if !v["tasks"].as_array().unwrap().iter().any(|t| t == task_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} was never removed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_runs_task_and_forgets_it() {
    let stack = start().await;
    let base = format!("http://{}/api/cmd", stack.agent);

    let (status, _) = call(&stack, Method::POST, &base, None, Some(json!({"cmd": "echo hi"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let task_id = submit(&stack, &base, Some(KEY), "echo hi").await;
    let ids_url = format!("{base}/ids");
    let (_, body) = call(&stack, Method::GET, &ids_url, Some(KEY), None).await;
    let ids: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids["target"], Value::Null);
    assert_eq!(ids["tasks"], json!([task_id]));

    let ws = open_ws(
        &format!("ws://{}/api/cmd/output?task_id={task_id}", stack.agent),
        Some(KEY),
    )
    .await
    .unwrap();
    let (lines, reason) = observe(ws).await;
    assert_eq!(lines, vec!["hi".to_string(), SUCCESS_BANNER.to_string()]);
    assert_eq!(reason.as_deref(), Some("task succeeded"));

    wait_until_gone(&stack, &ids_url, Some(KEY), &task_id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_output_reaches_observer_in_full() {
    let stack = start().await;
    let base = format!("http://{}/api/cmd", stack.agent);
    let task_id = submit(&stack, &base, Some(KEY), "seq 1 20000").await;

    let ws = open_ws(
        &format!("ws://{}/api/cmd/output?task_id={task_id}", stack.agent),
        Some(KEY),
    )
    .await
    .unwrap();
    let (lines, reason) = observe(ws).await;

    assert_eq!(lines.len(), 20001);
    assert_eq!(lines[0], "1");
    assert_eq!(lines[19999], "20000");
    assert_eq!(lines[20000], SUCCESS_BANNER);
    assert_eq!(reason.as_deref(), Some("task succeeded"));
}

#[tokio::test]
async fn test_forbidden_command_never_registers() {
    let stack = start().await;
    let base = format!("http://{}/api/cmd", stack.agent);

    let (status, body) = call(
        &stack,
        Method::POST,
        &base,
        Some(KEY),
        Some(json!({"cmd": "shutdown -h now"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!body.is_empty());

    let (_, body) = call(&stack, Method::GET, &format!("{base}/ids"), Some(KEY), None).await;
    let ids: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids["tasks"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_forwards_plain_and_duplex() {
    let stack = start().await;
    let base = format!("http://{}/api/cmd?name=local", stack.proxy);

    // No key from the caller: the proxy injects its own.
    let task_id = submit(&stack, &base, None, "echo through; exit 2").await;

    let (status, body) = call(
        &stack,
        Method::GET,
        &format!("http://{}/api/cmd/ids?name=local", stack.proxy),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids["target"], "local");

    let ws = open_ws(
        &format!(
            "ws://{}/api/cmd/output?name=local&task_id={task_id}",
            stack.proxy
        ),
        None,
    )
    .await
    .unwrap();
    let (lines, reason) = observe(ws).await;
    assert_eq!(lines[0], "through");
    assert!(lines[1].contains("exit status 2"), "{lines:?}");
    assert_eq!(reason.as_deref(), Some("task failed with exit code 2"));
}

#[tokio::test]
async fn test_proxy_rejects_unknown_target_and_dead_task() {
    let stack = start().await;

    let (status, _) = call(
        &stack,
        Method::GET,
        &format!("http://{}/api/cmd/ids?name=nowhere", stack.proxy),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    match open_ws(
        &format!("ws://{}/api/cmd/output?task_id=missing", stack.agent),
        Some(KEY),
    )
    .await
    {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), StatusCode::NOT_FOUND),
        other => panic!("expected 404 handshake failure, got {other:?}"),
    }

    match open_ws(
        &format!("ws://{}/api/cmd/output?name=local&task_id=missing", stack.proxy),
        None,
    )
    .await
    {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), StatusCode::BAD_GATEWAY),
        other => panic!("expected 502 handshake failure, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_script_session_through_proxy() {
    let stack = start().await;
    let mut ws = open_ws(
        &format!("ws://{}/api/cmd/script?name=local", stack.proxy),
        None,
    )
    .await
    .unwrap();

    let first = ws.next().await.unwrap().unwrap();
    let started: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(started["type"], "script.started");
    assert_eq!(started["status"], "started");

    ws.send(Message::text(
        json!({"type": "script.data", "data": "echo from-script\necho oops >&2"}).to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::text("not json")).await.unwrap();
    ws.send(Message::binary(b"exit 3".to_vec())).await.unwrap();
    ws.send(Message::text(json!({"type": "script.eof"}).to_string()))
        .await
        .unwrap();

    let (frames, _) = observe(ws).await;
    let messages: Vec<Value> = frames
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();

    assert!(messages
        .iter()
        .any(|m| m["type"] == "script.stdout" && m["data"] == "from-script"));
    assert!(messages
        .iter()
        .any(|m| m["type"] == "script.stderr" && m["data"] == "oops"));
    assert!(messages.iter().any(|m| m["type"] == "error"));
    let last = messages.last().unwrap();
    assert_eq!(last["type"], "script.exited");
    assert_eq!(last["code"], 3);
    assert_eq!(last["session_id"], started["session_id"]);
}

#[tokio::test]
async fn test_health_is_open_on_both_roles() {
    let stack = start().await;
    for (addr, role) in [(stack.agent, "agent"), (stack.proxy, "proxy")] {
        let (status, body) = call(
            &stack,
            Method::GET,
            &format!("http://{addr}/api/health"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["role"], role);
        assert_eq!(v["status"], "ok");
    }
}
