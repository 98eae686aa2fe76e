//! In-process tool server speaking MCP over SSE, for end-to-end client tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use ponos_mcp::McpClientConfig;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const TEST_TOKEN: &str = "test-token";

/// What the server does with one `tools/call`.
pub enum ToolAction {
    Reply(Value),
    ReplyAfter(Duration, Value),
    Error { code: i64, message: String, data: Option<Value> },
    /// Accept the request, never answer, and end the stream.
    CloseStream,
    /// Accept the request and never answer.
    Ignore,
}

type ToolFn = dyn Fn(&str, &Value, usize) -> ToolAction + Send + Sync;
type EventSender = mpsc::UnboundedSender<Result<Event, Infallible>>;

pub struct ServerState {
    streams: Mutex<HashMap<String, EventSender>>,
    expired: Mutex<HashSet<String>>,
    connections: AtomicUsize,
    tool_calls: AtomicUsize,
    announce_endpoint: AtomicBool,
    methods: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, Value)>>,
    auth_headers: Mutex<Vec<String>>,
    tools: Box<ToolFn>,
}

pub struct FakeToolServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl FakeToolServer {
    pub async fn start<F>(tools: F) -> Self
    where
        F: Fn(&str, &Value, usize) -> ToolAction + Send + Sync + 'static,
    {
        let state = Arc::new(ServerState {
            streams: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashSet::new()),
            connections: AtomicUsize::new(0),
            tool_calls: AtomicUsize::new(0),
            announce_endpoint: AtomicBool::new(true),
            methods: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            auth_headers: Mutex::new(Vec::new()),
            tools: Box::new(tools),
        });

        let app = Router::new()
            .route("/sse", get(open_stream))
            .route("/messages", post(receive_message))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client_config(&self) -> McpClientConfig {
        let mut config = McpClientConfig::default();
        config.server_url = self.url();
        config.client_name = "ponos-test".to_string();
        config.credentials.static_token = Some(TEST_TOKEN.to_string());
        config.connect_timeout = Duration::from_secs(5);
        config.request_timeout = Duration::from_secs(30);
        config.initialize_timeout = Duration::from_secs(5);
        config
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<String> {
        self.state.methods.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn auth_headers(&self) -> Vec<String> {
        self.state.auth_headers.lock().unwrap().clone()
    }

    pub fn set_announce_endpoint(&self, announce: bool) {
        self.state.announce_endpoint.store(announce, Ordering::SeqCst);
    }

    /// End every open stream.
    pub fn close_streams(&self) {
        self.state.streams.lock().unwrap().clear();
    }

    /// Streams whose client is still reading. Each stream gets a comment
    /// frame so a departed client is noticed on the write.
    pub fn live_streams(&self) -> usize {
        self.state
            .streams
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.send(Ok(Event::default().comment("ping"))).is_ok())
            .count()
    }

    /// Answer 404 for every session opened so far, leaving streams open.
    pub fn expire_sessions(&self) {
        let ids: Vec<String> = self.state.streams.lock().unwrap().keys().cloned().collect();
        self.state.expired.lock().unwrap().extend(ids);
    }
}

async fn open_stream(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Sse<UnboundedReceiverStream<Result<Event, Infallible>>> {
    record_auth(&state, &headers);
    let n = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let session_id = format!("session-{}", n);

    let (tx, rx) = mpsc::unbounded_channel();
    if state.announce_endpoint.load(Ordering::SeqCst) {
        let endpoint = format!("/messages?sessionId={}", session_id);
        let _ = tx.send(Ok(Event::default().event("endpoint").data(endpoint)));
    }
    state.streams.lock().unwrap().insert(session_id, tx);

    Sse::new(UnboundedReceiverStream::new(rx))
}

async fn receive_message(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    record_auth(&state, &headers);
    let session_id = query.get("sessionId").cloned().unwrap_or_default();

    if state.expired.lock().unwrap().contains(&session_id) {
        return StatusCode::NOT_FOUND;
    }
    let Some(tx) = state.streams.lock().unwrap().get(&session_id).cloned() else {
        return StatusCode::NOT_FOUND;
    };

    let method = body["method"].as_str().unwrap_or_default().to_string();
    state.methods.lock().unwrap().push(method.clone());
    let id = body["id"].clone();

    match method.as_str() {
        "initialize" => send_result(
            &tx,
            &id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-tools", "version": "0.1.0"}
            }),
        ),
        "tools/call" => {
            let name = body["params"]["name"].as_str().unwrap_or_default().to_string();
            let args = body["params"]["arguments"].clone();
            state.calls.lock().unwrap().push((name.clone(), args.clone()));
            let index = state.tool_calls.fetch_add(1, Ordering::SeqCst);

            match (state.tools)(&name, &args, index) {
                ToolAction::Reply(result) => send_result(&tx, &id, result),
                ToolAction::ReplyAfter(delay, result) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        send_result(&tx, &id, result);
                    });
                }
                ToolAction::Error { code, message, data } => {
                    let mut error = json!({"code": code, "message": message});
                    if let Some(data) = data {
                        error["data"] = data;
                    }
                    send_frame(&tx, json!({"jsonrpc": "2.0", "id": id, "error": error}));
                }
                ToolAction::CloseStream => {
                    state.streams.lock().unwrap().remove(&session_id);
                }
                ToolAction::Ignore => {}
            }
        }
        _ => {}
    }
    StatusCode::ACCEPTED
}

fn record_auth(state: &ServerState, headers: &HeaderMap) {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.auth_headers.lock().unwrap().push(value);
}

fn send_result(tx: &EventSender, id: &Value, result: Value) {
    send_frame(tx, json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn send_frame(tx: &EventSender, frame: Value) {
    let _ = tx.send(Ok(Event::default().event("message").data(frame.to_string())));
}

/// `{content: [{type: text, text: <doc as JSON>}]}`
pub fn text_result(doc: Value) -> Value {
    json!({"content": [{"type": "text", "text": doc.to_string()}]})
}

pub fn tool_error(message: &str) -> Value {
    json!({"content": [{"type": "text", "text": message}], "isError": true})
}
