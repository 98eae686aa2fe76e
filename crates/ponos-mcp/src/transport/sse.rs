//! SSE (Server-Sent Events) transport for the HTTP tool server

use futures::StreamExt;
use ponos_core::{PonosError, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use reqwest_eventsource::{retry, Error as EventSourceError, Event, EventSource};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{normalize_server_url, resolve_endpoint, SessionEndpoint, StreamHandler};
use crate::rate_limit;
use crate::types::Envelope;

/// Opens streams and submits requests for one configured server.
#[derive(Clone)]
pub struct SseTransport {
    http: reqwest::Client,
    base_url: String,
    stream_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("base_url", &self.base_url)
            .field("stream_url", &self.stream_url)
            .finish()
    }
}

/// One open stream generation. Dropping it stops the reader task.
pub struct SseStream {
    endpoint: SessionEndpoint,
    reader: JoinHandle<()>,
}

impl SseStream {
    pub fn endpoint(&self) -> &SessionEndpoint {
        &self.endpoint
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl SseTransport {
    /// `http` must not carry a total request timeout or the stream would be
    /// cut off after it elapses.
    pub fn new(
        http: reqwest::Client,
        server_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let (base_url, stream_url) = normalize_server_url(server_url);
        Self {
            http,
            base_url,
            stream_url,
            connect_timeout,
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    /// Open the stream and wait for the session endpoint.
    ///
    /// Frames that arrive afterwards go to `handler`. The attempt is not
    /// retried here.
    pub async fn open(
        &self,
        token: &SecretString,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SseStream> {
        info!("Connecting to tool server stream: {}", self.stream_url);

        let request = self
            .http
            .get(&self.stream_url)
            .header(ACCEPT, "text/event-stream")
            .bearer_auth(token.expose_secret());

        let mut source = EventSource::new(request)
            .map_err(|e| PonosError::Transport(format!("failed to build stream request: {}", e)))?;
        source.set_retry_policy(Box::new(retry::Never));

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(
            source,
            self.base_url.clone(),
            handler,
            endpoint_tx,
        ));

        let endpoint = match timeout(self.connect_timeout, endpoint_rx).await {
            Ok(Ok(Ok(endpoint))) => endpoint,
            Ok(Ok(Err(e))) => {
                reader.abort();
                return Err(e);
            }
            Ok(Err(_)) => {
                reader.abort();
                return Err(PonosError::StreamClosed(
                    "reader stopped before the endpoint was announced".into(),
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(PonosError::ConnectTimeout {
                    url: self.stream_url.clone(),
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                });
            }
        };

        info!(
            "Tool server session established: {} (session {})",
            endpoint.url,
            endpoint.session_id.as_deref().unwrap_or("-")
        );
        Ok(SseStream { endpoint, reader })
    }

    /// POST one envelope to the session endpoint. The reply arrives on the stream.
    pub async fn submit<T: Serialize + ?Sized>(
        &self,
        endpoint: &SessionEndpoint,
        token: &SecretString,
        body: &T,
    ) -> Result<()> {
        let response = self
            .http
            .post(endpoint.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(token.expose_secret())
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| PonosError::Transport(format!("failed to submit request: {}", e)))?;

        let status = response.status();
        if let Some(err) = rate_limit::check_response(status, response.headers()) {
            return Err(err);
        }
        if status == StatusCode::OK || status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(PonosError::SessionExpired {
                session_id: endpoint.session_id.clone().unwrap_or_default(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(PonosError::Transport(format!(
            "server returned status {}: {}",
            status.as_u16(),
            body.trim()
        )))
    }
}

async fn read_stream(
    mut source: EventSource,
    base_url: String,
    handler: Arc<dyn StreamHandler>,
    endpoint_tx: oneshot::Sender<Result<SessionEndpoint>>,
) {
    let mut endpoint_tx = Some(endpoint_tx);

    let failure = loop {
        match source.next().await {
            Some(Ok(Event::Open)) => debug!("SSE connection opened"),
            Some(Ok(Event::Message(msg))) => {
                debug!("SSE event '{}': {}", msg.event, preview(&msg.data));
                match msg.event.as_str() {
                    "endpoint" => match endpoint_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(resolve_endpoint(&base_url, &msg.data));
                        }
                        None => debug!("Ignoring repeated endpoint event"),
                    },
                    "message" | "" => match Envelope::parse(&msg.data) {
                        Ok(envelope) => handler.on_message(envelope),
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    other => debug!("Ignoring unknown SSE event '{}'", other),
                }
            }
            Some(Err(e)) => break classify(e),
            None => break PonosError::StreamClosed("server closed the stream".into()),
        }
    };
    source.close();

    match endpoint_tx.take() {
        Some(tx) => {
            let _ = tx.send(Err(failure));
        }
        None => {
            error!("Tool server stream ended: {}", failure);
            handler.on_closed(failure.to_string());
        }
    }
}

fn classify(error: EventSourceError) -> PonosError {
    match error {
        EventSourceError::InvalidStatusCode(status, response) => {
            rate_limit::check_response(status, response.headers()).unwrap_or_else(|| {
                PonosError::Transport(format!(
                    "stream request failed with HTTP {}",
                    status.as_u16()
                ))
            })
        }
        EventSourceError::StreamEnded => PonosError::StreamClosed("server closed the stream".into()),
        other => PonosError::Transport(format!("stream error: {}", other)),
    }
}

fn preview(data: &str) -> String {
    match data.char_indices().nth(100) {
        Some((idx, _)) => format!("{}...", &data[..idx]),
        None => data.to_string(),
    }
}
