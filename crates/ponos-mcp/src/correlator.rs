//! Matches replies arriving on the stream to the requests that caused them

use ponos_core::{PonosError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use crate::types::{Envelope, JsonRpcRequest, JsonRpcResponse};

/// What a waiting caller receives in its slot.
#[derive(Debug)]
pub enum Reply {
    Response(JsonRpcResponse),
    /// The stream ended before a response arrived.
    Closed(String),
}

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<Reply>>>;

#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: PendingTable,
}

/// Removes its table entry when dropped, whichever way the wait ended.
struct PendingSlot<'a> {
    id: u64,
    table: &'a PendingTable,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut pending = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        pending.remove(&self.id);
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Register a slot for `request`, hand it to `submit`, and wait for the
    /// matching response or `request_timeout`.
    ///
    /// An id is allocated when the request has none. Dropping the returned
    /// future deregisters the request.
    pub async fn send<F, Fut>(
        &self,
        mut request: JsonRpcRequest,
        request_timeout: Duration,
        submit: F,
    ) -> Result<JsonRpcResponse>
    where
        F: FnOnce(JsonRpcRequest) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let id = *request.id.get_or_insert_with(|| self.next_id());
        let method = request.method.clone();
        let (_slot, rx) = self.register(id)?;

        debug!("Sending request {} ({})", id, method);
        submit(request).await?;

        match timeout(request_timeout, rx).await {
            Ok(Ok(Reply::Response(response))) => Ok(response),
            Ok(Ok(Reply::Closed(reason))) => Err(PonosError::StreamClosed(reason)),
            Ok(Err(_)) => Err(PonosError::StreamClosed(format!(
                "reply slot for request {} was dropped",
                id
            ))),
            Err(_) => Err(PonosError::RequestTimeout {
                id,
                method,
                timeout_ms: request_timeout.as_millis() as u64,
            }),
        }
    }

    fn register(&self, id: u64) -> Result<(PendingSlot<'_>, oneshot::Receiver<Reply>)> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(PonosError::Protocol(format!(
                "request id {} is already outstanding",
                id
            )));
        }
        pending.insert(id, tx);
        drop(pending);

        Ok((
            PendingSlot {
                id,
                table: &self.pending,
            },
            rx,
        ))
    }

    /// Route one inbound frame. Only responses resolve pending requests.
    pub fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Response(response) => {
                let id = response.id;
                let slot = self.lock().remove(&id);
                match slot {
                    Some(tx) => {
                        if tx.send(Reply::Response(response)).is_err() {
                            debug!("Caller for request {} is gone; reply dropped", id);
                        }
                    }
                    None => debug!("Dropping reply for unknown request id {}", id),
                }
            }
            Envelope::Notification(notification) => {
                debug!("Server notification: {}", notification.method);
            }
            Envelope::ServerRequest { id, method } => {
                debug!("Ignoring server-initiated request {} ({})", id, method);
            }
        }
    }

    /// Unblock every outstanding request with a stream-closed reply.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Reply::Closed(reason.to_string()));
        }
        if count > 0 {
            debug!("Failed {} pending request(s): {}", count, reason);
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
