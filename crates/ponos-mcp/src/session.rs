//! Session lifecycle: one live stream at a time, (re)connected on demand

use ponos_core::{PonosError, Result};
use serde::Serialize;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::CredentialManager;
use crate::correlator::Correlator;
use crate::transport::{SessionEndpoint, SseStream, SseTransport, StreamHandler};
use crate::types::{
    ClientCapabilities, ClientInfo, Envelope, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerInfo, PROTOCOL_VERSION,
};

/// What a caller needs to submit on the current session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub endpoint: SessionEndpoint,
    pub protocol_version: String,
    pub server: Option<ServerInfo>,
}

impl SessionSnapshot {
    pub fn session_id(&self) -> Option<&str> {
        self.endpoint.session_id.as_deref()
    }
}

enum SessionState {
    Disconnected,
    Connecting {
        generation: u64,
    },
    Ready {
        session: SessionSnapshot,
        stream: SseStream,
    },
}

impl SessionState {
    fn generation(&self) -> Option<u64> {
        match self {
            SessionState::Disconnected => None,
            SessionState::Connecting { generation } => Some(*generation),
            SessionState::Ready { session, .. } => Some(session.generation),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting { .. } => "connecting",
            SessionState::Ready { .. } => "ready",
        }
    }
}

type SharedState = Arc<Mutex<SessionState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes one stream generation's frames to the correlator.
///
/// The state is held weakly: it owns the stream whose reader owns this sink.
struct SessionSink {
    generation: u64,
    correlator: Arc<Correlator>,
    state: Weak<Mutex<SessionState>>,
}

impl StreamHandler for SessionSink {
    fn on_message(&self, envelope: Envelope) {
        self.correlator.dispatch(envelope);
    }

    fn on_closed(&self, reason: String) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let previous = {
            let mut state = lock_state(&state);
            if state.generation() == Some(self.generation) {
                Some(mem::replace(&mut *state, SessionState::Disconnected))
            } else {
                None
            }
        };

        match previous {
            Some(previous) => {
                warn!(
                    "Session generation {} lost: {}",
                    self.generation, reason
                );
                drop(previous);
                self.correlator.fail_all(&reason);
            }
            None => debug!(
                "Ignoring close of superseded stream generation {}",
                self.generation
            ),
        }
    }
}

pub struct SessionManager {
    transport: SseTransport,
    credentials: Arc<CredentialManager>,
    correlator: Arc<Correlator>,
    state: SharedState,
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    client_info: ClientInfo,
    request_timeout: Duration,
    initialize_timeout: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("transport", &self.transport)
            .field("state", &self.state_name())
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        transport: SseTransport,
        credentials: Arc<CredentialManager>,
        client_info: ClientInfo,
        request_timeout: Duration,
        initialize_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            credentials,
            correlator: Arc::new(Correlator::new()),
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            client_info,
            request_timeout,
            initialize_timeout,
        }
    }

    pub fn state_name(&self) -> &'static str {
        lock_state(&self.state).name()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// The live session, if any. A session whose reader has exited is not live.
    pub fn current(&self) -> Option<SessionSnapshot> {
        match &*lock_state(&self.state) {
            SessionState::Ready { session, stream } if !stream.is_finished() => {
                Some(session.clone())
            }
            _ => None,
        }
    }

    /// Return the live session, connecting first when there is none.
    ///
    /// Concurrent callers wait on the same connection attempt.
    pub async fn ensure_connected(&self) -> Result<SessionSnapshot> {
        if let Some(session) = self.current() {
            return Ok(session);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(session) = self.current() {
            return Ok(session);
        }
        self.connect_and_initialize().await
    }

    /// Tear the current session down and establish a new one.
    pub async fn reconnect(&self) -> Result<SessionSnapshot> {
        let _guard = self.connect_lock.lock().await;
        self.connect_and_initialize().await
    }

    /// Reconnect after a failure on `stale`, unless another caller already
    /// replaced that generation while this one waited for the guard.
    pub async fn reconnect_from(&self, stale: Option<u64>) -> Result<SessionSnapshot> {
        let _guard = self.connect_lock.lock().await;
        if let Some(session) = self.current() {
            if Some(session.generation) != stale {
                debug!(
                    "Session already replaced by generation {}",
                    session.generation
                );
                return Ok(session);
            }
        }
        self.connect_and_initialize().await
    }

    /// Drop the stream and fail anything still waiting on it.
    pub fn disconnect(&self, reason: &str) {
        let previous = mem::replace(&mut *lock_state(&self.state), SessionState::Disconnected);
        if let SessionState::Ready { session, .. } = &previous {
            info!(
                "Closing session generation {} ({})",
                session.generation, reason
            );
        }
        drop(previous);
        self.correlator.fail_all(reason);
    }

    /// Send a request on the live session, connecting first if needed.
    pub async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let session = self.ensure_connected().await?;
        self.request_on(&session, request).await
    }

    /// Send a request on a specific session generation.
    pub async fn request_on(
        &self,
        session: &SessionSnapshot,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        self.send_with_timeout(session, request, self.request_timeout)
            .await
    }

    // Caller must hold `connect_lock`.
    async fn connect_and_initialize(&self) -> Result<SessionSnapshot> {
        self.disconnect("reconnecting");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock_state(&self.state) = SessionState::Connecting { generation };

        match self.open_and_handshake(generation).await {
            Ok(session) => Ok(session),
            Err(e) => {
                let mut state = lock_state(&self.state);
                if state.generation() == Some(generation) {
                    *state = SessionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    async fn open_and_handshake(&self, generation: u64) -> Result<SessionSnapshot> {
        let token = self.credentials.access_token().await?;
        let sink = Arc::new(SessionSink {
            generation,
            correlator: self.correlator.clone(),
            state: Arc::downgrade(&self.state),
        });
        let stream = self.transport.open(&token, sink).await?;

        let mut session = SessionSnapshot {
            generation,
            endpoint: stream.endpoint().clone(),
            protocol_version: String::new(),
            server: None,
        };

        let init = self.initialize(&session).await?;
        session.protocol_version = init.protocol_version;
        session.server = init.server_info;

        let mut state = lock_state(&self.state);
        if state.generation() != Some(generation) {
            return Err(PonosError::StreamClosed(
                "stream closed during the initialize handshake".into(),
            ));
        }
        *state = SessionState::Ready {
            session: session.clone(),
            stream,
        };
        Ok(session)
    }

    async fn initialize(&self, session: &SessionSnapshot) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: self.client_info.clone(),
        };
        let request = JsonRpcRequest::new("initialize", Some(serde_json::to_value(params)?));

        let response = self
            .send_with_timeout(session, request, self.initialize_timeout)
            .await?;
        let result: InitializeResult = serde_json::from_value(response.into_result()?)
            .map_err(|e| PonosError::Protocol(format!("invalid initialize result: {}", e)))?;

        match &result.server_info {
            Some(server) => info!(
                "Initialized with {} {} (protocol {})",
                server.name, server.version, result.protocol_version
            ),
            None => info!("Initialized (protocol {})", result.protocol_version),
        }

        let notification = JsonRpcNotification::new("notifications/initialized", None);
        self.submit(session, &notification).await?;
        debug!("Sent notifications/initialized");

        Ok(result)
    }

    async fn send_with_timeout(
        &self,
        session: &SessionSnapshot,
        request: JsonRpcRequest,
        request_timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let result = self
            .correlator
            .send(request, request_timeout, |req| async move {
                self.submit(session, &req).await
            })
            .await;

        if let Err(PonosError::SessionExpired { .. }) = &result {
            self.invalidate(session.generation, "session expired");
        }
        result
    }

    async fn submit<T: Serialize + ?Sized>(&self, session: &SessionSnapshot, body: &T) -> Result<()> {
        // A replaced generation's endpoint is gone.
        if lock_state(&self.state).generation() != Some(session.generation) {
            return Err(PonosError::StreamClosed(format!(
                "session generation {} was replaced",
                session.generation
            )));
        }
        let token = self.credentials.access_token().await?;
        self.transport.submit(&session.endpoint, &token, body).await
    }

    /// Mark `generation` dead if it is still the current one.
    fn invalidate(&self, generation: u64, reason: &str) {
        let previous = {
            let mut state = lock_state(&self.state);
            if state.generation() != Some(generation) {
                return;
            }
            mem::replace(&mut *state, SessionState::Disconnected)
        };
        warn!("Session generation {} invalidated: {}", generation, reason);
        drop(previous);
        self.correlator.fail_all(reason);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.disconnect("client dropped");
    }
}
