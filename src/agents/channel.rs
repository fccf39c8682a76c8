//! Request/response multiplexer over one agent stream.
//!
//! ## Message flow
//!
//! ```text
//!                     ┌──────────── pending: id -> oneshot ◄────┐
//! callers ── send_and_wait_response ──► sink (write lock)       │
//!                                                                │
//! source ──► receiver task ──┬── response payload ──────────────┘
//!                            ├── request payload ──► requests (cap 32)
//!                            └── non-OK status ──► cancel pending id
//! ```
//!
//! Closing is one-shot: every waiting and later caller is released with the
//! closing cause, and the request sequence ends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::IntCounter;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::proto::{
    AgentRequestPayload, AgentResponsePayload, Inbound, RequestId, ServerMessage,
    ServerRequestPayload, ServerResponsePayload, Status,
};
use super::transport::{MessageSink, MessageSource, TransportError};

/// Capacity of the agent request queue. A full queue stalls the reader.
const AGENT_REQUESTS_CAP: usize = 32;

/// How many abandoned request ids are remembered. Late replies to older ids
/// are treated like replies without a subscriber.
const ABANDONED_CAP: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The agent answered this request with a non-OK status.
    #[error("agent returned {0}")]
    Remote(Status),

    #[error("no response within {0:?}")]
    DeadlineExceeded(Duration),

    /// The peer ended the stream cleanly.
    #[error("channel closed")]
    Closed,

    /// Closed by the hub (kick or shutdown).
    #[error("channel terminated: {0}")]
    Terminated(String),
}

/// A request initiated by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub id: RequestId,
    pub payload: AgentRequestPayload,
}

/// The hub's answer to an [`AgentRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServerResponse {
    pub id: RequestId,
    pub status: Status,
    pub payload: Option<ServerResponsePayload>,
}

impl ServerResponse {
    pub fn new(id: RequestId, payload: impl Into<ServerResponsePayload>) -> Self {
        Self {
            id,
            status: Status::ok(),
            payload: Some(payload.into()),
        }
    }

    pub fn with_status(id: RequestId, status: Status) -> Self {
        Self {
            id,
            status,
            payload: None,
        }
    }
}

/// Snapshot of channel activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    pub sent: u64,
    pub received: u64,
    /// Requests waiting for an agent response.
    pub responses: usize,
    /// Agent requests queued for the dispatch loop.
    pub requests: usize,
}

/// Prometheus counters a channel increments alongside its own totals.
#[derive(Debug, Clone, Default)]
pub struct ChannelCounters {
    pub sent: Option<IntCounter>,
    pub received: Option<IntCounter>,
}

type Reply = Result<AgentResponsePayload, ChannelError>;

#[derive(Default)]
struct PendingTable {
    waiting: HashMap<RequestId, oneshot::Sender<Reply>>,
    /// Ids whose caller stopped waiting, oldest first. A late reply is dropped.
    abandoned: VecDeque<RequestId>,
}

impl PendingTable {
    fn abandon(&mut self, id: RequestId) {
        if self.waiting.remove(&id).is_none() {
            return;
        }
        if self.abandoned.len() == ABANDONED_CAP {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(id);
    }

    fn forget_abandoned(&mut self, id: RequestId) -> bool {
        match self.abandoned.iter().position(|&abandoned| abandoned == id) {
            Some(index) => {
                self.abandoned.remove(index);
                true
            }
            None => false,
        }
    }
}

pub struct Channel {
    label: String,
    sink: AsyncMutex<Box<dyn MessageSink>>,
    last_request_id: AtomicU32,
    /// `None` once closed.
    pending: Mutex<Option<PendingTable>>,
    requests: Mutex<Option<mpsc::Receiver<AgentRequest>>>,
    requests_tx: mpsc::WeakSender<AgentRequest>,
    closed: CancellationToken,
    close_cause: OnceLock<Option<ChannelError>>,
    sent: AtomicU64,
    received: AtomicU64,
    counters: ChannelCounters,
}

impl Channel {
    /// Wrap a transport and start the receiver task.
    ///
    /// `label` only shows up in logs.
    pub fn new(
        label: impl Into<String>,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
        counters: ChannelCounters,
    ) -> Arc<Self> {
        let (requests_tx, requests_rx) = mpsc::channel(AGENT_REQUESTS_CAP);

        let channel = Arc::new(Self {
            label: label.into(),
            sink: AsyncMutex::new(sink),
            last_request_id: AtomicU32::new(0),
            pending: Mutex::new(Some(PendingTable::default())),
            requests: Mutex::new(Some(requests_rx)),
            requests_tx: requests_tx.downgrade(),
            closed: CancellationToken::new(),
            close_cause: OnceLock::new(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            counters,
        });

        tokio::spawn(channel.clone().run_receiver(source, requests_tx));

        channel
    }

    /// The sequence of agent-initiated requests.
    ///
    /// Can only be taken once; later calls return `None`. The sequence ends
    /// when the channel closes and must be drained by its consumer.
    pub fn requests(&self) -> Option<mpsc::Receiver<AgentRequest>> {
        self.requests.lock().take()
    }

    /// Answer an agent request. Does nothing once the channel is closed.
    pub async fn send(&self, response: ServerResponse) {
        let message = ServerMessage {
            id: response.id,
            status: response.status,
            payload: response.payload.map(Into::into),
        };
        self.write(message).await;
    }

    /// Send a request to the agent and wait for its answer.
    ///
    /// There is no timeout: the call returns when the agent answers, answers
    /// with a non-OK status, or the channel closes.
    pub async fn send_and_wait_response(
        &self,
        payload: impl Into<ServerRequestPayload>,
    ) -> Result<AgentResponsePayload, ChannelError> {
        let (id, rx) = self.subscribe()?;
        let mut subscription = Subscription {
            channel: self,
            id,
            settled: false,
        };

        self.write(ServerMessage {
            id,
            status: Status::ok(),
            payload: Some(payload.into().into()),
        })
        .await;

        let reply = rx.await;
        subscription.settled = true;
        match reply {
            Ok(reply) => reply,
            Err(_) => Err(self.close_error()),
        }
    }

    /// Like [`send_and_wait_response`](Self::send_and_wait_response) but
    /// gives up after `deadline`. The channel stays open; a reply arriving
    /// later is dropped.
    pub async fn send_and_wait_response_timeout(
        &self,
        payload: impl Into<ServerRequestPayload>,
        deadline: Duration,
    ) -> Result<AgentResponsePayload, ChannelError> {
        tokio::time::timeout(deadline, self.send_and_wait_response(payload))
            .await
            .map_err(|_| ChannelError::DeadlineExceeded(deadline))?
    }

    /// Wait until the channel is closed. Returns the closing cause, `Ok` if
    /// the peer ended the stream cleanly.
    pub async fn wait(&self) -> Result<(), ChannelError> {
        self.closed.cancelled().await;
        match self.close_cause.get() {
            Some(Some(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the channel from the hub side.
    pub fn terminate(&self, reason: impl Into<String>) {
        self.close(Some(ChannelError::Terminated(reason.into())));
    }

    pub fn metrics(&self) -> ChannelMetrics {
        let responses = self
            .pending
            .lock()
            .as_ref()
            .map_or(0, |table| table.waiting.len());
        let requests = self
            .requests_tx
            .upgrade()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());

        ChannelMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            responses,
            requests,
        }
    }

    #[instrument(skip_all, fields(agent = %self.label))]
    async fn run_receiver(
        self: Arc<Self>,
        mut source: Box<dyn MessageSource>,
        requests_tx: mpsc::Sender<AgentRequest>,
    ) {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = source.recv() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    self.close(Some(err.into()));
                    break;
                }
                None => {
                    self.close(None);
                    break;
                }
            };

            self.received.fetch_add(1, Ordering::Relaxed);
            if let Some(counter) = &self.counters.received {
                counter.inc();
            }
            trace!("received message {}", message.id);

            if !message.status.is_ok() {
                self.resolve(message.id, Err(ChannelError::Remote(message.status)));
                continue;
            }

            let Some(payload) = message.payload else {
                self.close(Some(ChannelError::ProtocolViolation(format!(
                    "message {} has no payload",
                    message.id
                ))));
                break;
            };

            match payload.classify() {
                Inbound::Request(payload) => {
                    let request = AgentRequest {
                        id: message.id,
                        payload,
                    };
                    tokio::select! {
                        _ = self.closed.cancelled() => break,
                        res = requests_tx.send(request) => {
                            if res.is_err() {
                                debug!("request consumer is gone, dropping request");
                            }
                        }
                    }
                }
                Inbound::Response(payload) => self.resolve(message.id, Ok(payload)),
            }
        }

        debug!("receiver task done");
    }

    async fn write(&self, message: ServerMessage) {
        let mut sink = self.sink.lock().await;
        if self.closed.is_cancelled() {
            return;
        }

        trace!(agent = %self.label, "sending message {}", message.id);
        let res = tokio::select! {
            _ = self.closed.cancelled() => return,
            res = sink.send(&message) => res,
        };
        drop(sink);

        match res {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                if let Some(counter) = &self.counters.sent {
                    counter.inc();
                }
            }
            Err(err) => self.close(Some(err.into())),
        }
    }

    fn subscribe(&self) -> Result<(RequestId, oneshot::Receiver<Reply>), ChannelError> {
        let id = self
            .last_request_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock();
        let Some(table) = pending.as_mut() else {
            drop(pending);
            return Err(self.close_error());
        };
        if table.waiting.contains_key(&id) {
            drop(pending);
            let err = ChannelError::ProtocolViolation(format!("duplicate request ID {id}"));
            self.close(Some(err.clone()));
            return Err(err);
        }
        // a wrapped id must not keep an old tombstone
        table.forget_abandoned(id);
        table.waiting.insert(id, tx);

        Ok((id, rx))
    }

    fn resolve(&self, id: RequestId, reply: Reply) {
        let (waiter, late) = {
            let mut pending = self.pending.lock();
            let Some(table) = pending.as_mut() else {
                return;
            };
            match table.waiting.remove(&id) {
                Some(tx) => (Some(tx), false),
                None => (None, table.forget_abandoned(id)),
            }
        };

        match waiter {
            Some(tx) => {
                // the waiter may have gone away in the meantime
                let _ = tx.send(reply);
            }
            None if late => debug!(agent = %self.label, "dropping late reply for {id}"),
            None => self.close(Some(ChannelError::ProtocolViolation(format!(
                "no subscriber for ID {id}"
            )))),
        }
    }

    fn abandon(&self, id: RequestId) {
        if let Some(table) = self.pending.lock().as_mut() {
            table.abandon(id);
        }
    }

    fn close(&self, cause: Option<ChannelError>) {
        if self.close_cause.set(cause.clone()).is_err() {
            return;
        }

        match &cause {
            Some(err) => warn!(agent = %self.label, "closing channel: {err}"),
            None => debug!(agent = %self.label, "closing channel"),
        }

        let waiters = self.pending.lock().take();
        let err = cause.unwrap_or(ChannelError::Closed);
        for tx in waiters.into_iter().flat_map(|table| table.waiting.into_values()) {
            let _ = tx.send(Err(err.clone()));
        }

        self.closed.cancel();
    }

    fn close_error(&self) -> ChannelError {
        self.close_cause
            .get()
            .cloned()
            .flatten()
            .unwrap_or(ChannelError::Closed)
    }
}

/// Abandons the pending request if the waiting future is dropped early.
struct Subscription<'a> {
    channel: &'a Channel,
    id: RequestId,
    settled: bool,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.channel.abandon(self.id);
        }
    }
}
