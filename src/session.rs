//! Streaming Sessions
//!
//! A [`StreamSession`] wraps one accepted request/response pair. The
//! response body is an unbounded sequence of newline-terminated JSON lines
//! fed through an in-process channel; the receiving half of that channel is
//! handed to the HTTP stack as the body stream, and dropping it is the
//! edge-triggered signal that the transport closed.
//!
//! The session lifecycle is an explicit two-state machine: `active` until
//! the transport is observed closed (by either peer), then `closed`.
//! Transitioning to `closed` is the single place that unsubscribes the
//! heartbeat callback, fires the `Close` listeners and detaches every
//! registered callback, so application code holding a stale handle cannot
//! leak listeners or receive further deliveries.

use std::convert::Infallible;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::StreamError;
use crate::heartbeat::{HeartbeatClock, SubscriptionId};

/// Lifecycle events a session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired once, after the response headers are prepared and the
    /// application callback has run.
    Open,
    /// Fired once, when the transport is observed closed by either peer.
    Close,
}

type LifecycleListener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Listeners {
    open: Vec<LifecycleListener>,
    close: Vec<LifecycleListener>,
}

/// Read-only view of the inbound request, exposed to application code.
pub struct SessionRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Value>,
}

impl SessionRequest {
    pub(crate) fn new(method: Method, uri: Uri, headers: HeaderMap, body: Option<Value>) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The request body decoded as JSON, if there was one and it parsed.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

struct SessionInner {
    id: Uuid,
    request: SessionRequest,
    /// Sending half of the response body channel. Taken on close so later
    /// sends become no-ops.
    outbound: Mutex<Option<UnboundedSender<Bytes>>>,
    listeners: Mutex<Listeners>,
    /// Back-reference to the shared clock, removed exactly once on close.
    heartbeat: Mutex<Option<(Arc<HeartbeatClock>, SubscriptionId)>>,
    closed: AtomicBool,
    opened: AtomicBool,
}

/// Handle to one long-lived streaming connection.
///
/// Clones share the same underlying session; the handle is cheap to clone
/// into heartbeat callbacks, lifecycle listeners and producer tasks.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl StreamSession {
    /// Create a session and the body stream feeding its response.
    pub(crate) fn new(request: SessionRequest) -> (Self, SessionBody) {
        let (tx, rx) = mpsc::unbounded_channel();

        let session = Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                request,
                outbound: Mutex::new(Some(tx)),
                listeners: Mutex::new(Listeners::default()),
                heartbeat: Mutex::new(None),
                closed: AtomicBool::new(false),
                opened: AtomicBool::new(false),
            }),
        };

        let body = SessionBody {
            rx,
            session: session.clone(),
        };

        (session, body)
    }

    /// Identifier used in log output.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The inbound request this session was built from.
    pub fn request(&self) -> &SessionRequest {
        &self.inner.request
    }

    /// Whether the session has transitioned to `closed`.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Serialize `message` to a single compact JSON line terminated by `\n`
    /// and queue it for the peer.
    ///
    /// A message that encodes to JSON `null` or a bare scalar fails with
    /// [`StreamError::InvalidMessage`]; that is a programmer error in the
    /// caller, raised synchronously. A send against a transport the peer
    /// has already closed is the expected race of network concurrency and
    /// is dropped silently.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), StreamError> {
        let value = serde_json::to_value(message)?;
        if !(value.is_object() || value.is_array()) {
            return Err(StreamError::InvalidMessage);
        }

        let mut line = value.to_string();
        line.push('\n');
        self.inner.write(Bytes::from(line));
        Ok(())
    }

    /// Terminate the outbound stream and release the session's listeners.
    ///
    /// Queued lines are still delivered before the stream ends. Calling
    /// this on an already half-closed transport does nothing.
    pub fn close(&self) {
        self.inner.teardown();
    }

    /// Register a one-shot listener for the `Open` event. Registrations
    /// after close are dropped.
    pub fn on_open(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        listeners.open.push(Box::new(listener));
    }

    /// Register a one-shot listener for the `Close` event. Registrations
    /// after close are dropped.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        listeners.close.push(Box::new(listener));
    }

    /// Number of listeners currently registered for `event`.
    pub fn listener_count(&self, event: SessionEvent) -> usize {
        let listeners = self.inner.listeners.lock().unwrap();
        match event {
            SessionEvent::Open => listeners.open.len(),
            SessionEvent::Close => listeners.close.len(),
        }
    }

    /// Record the heartbeat subscription to remove on close.
    pub(crate) fn attach_heartbeat(&self, clock: Arc<HeartbeatClock>, id: SubscriptionId) {
        let mut slot = self.inner.heartbeat.lock().unwrap();
        if self.inner.closed.load(Ordering::SeqCst) {
            drop(slot);
            clock.unsubscribe(id);
            return;
        }
        *slot = Some((clock, id));
    }

    /// Fire the `Open` listeners. Does nothing on a session that already
    /// closed (the session was never observably open) or that has already
    /// fired them.
    pub(crate) fn emit_open(&self) {
        self.inner.emit_open();
    }
}

impl SessionInner {
    fn write(&self, line: Bytes) {
        let outbound = self.outbound.lock().unwrap();
        let Some(tx) = outbound.as_ref() else {
            tracing::trace!(session = %self.id, "send on closed session ignored");
            return;
        };

        // The receiving half is the response body; it is gone once the peer
        // hangs up. A send racing that teardown is expected, not a fault.
        if tx.send(line).is_err() {
            tracing::trace!(session = %self.id, "send raced transport close, dropped");
        }
    }

    fn emit_open(&self) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::trace!(session = %self.id, "session closed before open");
            return;
        }
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }

        let open_listeners = std::mem::take(&mut self.listeners.lock().unwrap().open);
        for listener in open_listeners {
            if catch_unwind(AssertUnwindSafe(move || listener())).is_err() {
                tracing::error!(session = %self.id, "open listener panicked");
            }
        }
    }

    /// The single `active` → `closed` transition. Idempotent: both a local
    /// `close()` and the body stream being dropped funnel through here.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // End the outbound stream; queued lines still drain to the peer.
        *self.outbound.lock().unwrap() = None;

        let heartbeat = self.heartbeat.lock().unwrap().take();
        if let Some((clock, id)) = heartbeat {
            clock.unsubscribe(id);
        }

        let close_listeners = {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.open.clear();
            std::mem::take(&mut listeners.close)
        };
        for listener in close_listeners {
            if catch_unwind(AssertUnwindSafe(move || listener())).is_err() {
                tracing::error!(session = %self.id, "close listener panicked");
            }
        }

        tracing::debug!(session = %self.id, "stream session closed");
    }
}

/// Response body stream of a session: yields queued JSON lines until the
/// session closes. Dropping it (hyper does so when the connection ends) is
/// the transport-close signal that triggers session teardown.
pub(crate) struct SessionBody {
    rx: UnboundedReceiver<Bytes>,
    session: StreamSession,
}

impl Stream for SessionBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for SessionBody {
    fn drop(&mut self) {
        self.session.inner.teardown();
    }
}
