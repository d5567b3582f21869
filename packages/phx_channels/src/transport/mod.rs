//! Pluggable connection underneath a [`Socket`](crate::Socket).
//!
//! A transport carries serialized frames in both directions and reports what
//! happens to it through four events: open, error, message and close. The
//! socket never looks at which transport it is driving.
//!
//! Two transports ship with the crate:
//! - [`websocket::WebSocket`] (default), a persistent WebSocket connection
//! - [`longpoll::LongPoller`], an HTTP long-poll fallback built on [`ajax::Ajax`]

pub mod ajax;
pub mod longpoll;
pub mod websocket;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use self::ajax::Ajax;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state shared between a transport handle and its I/O task.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl SharedState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(Self::encode(state)))
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(Self::encode(state), Ordering::Release);
    }

    fn encode(state: ConnectionState) -> u8 {
        match state {
            ConnectionState::Connecting => 0,
            ConnectionState::Open => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }
}

/// What a transport reports back to its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Error(String),
    Message(String),
    Close,
}

/// The four callbacks a transport is wired with.
///
/// Events are queued to the owning socket. Once the socket drops the other
/// end (it does so before closing a transport on purpose), every later event
/// is silently discarded.
#[derive(Debug, Clone)]
pub struct TransportHandler {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportHandler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn on_open(&self) {
        let _ = self.tx.send(TransportEvent::Open);
    }

    pub fn on_error(&self, reason: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Error(reason.into()));
    }

    pub fn on_message(&self, data: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Message(data.into()));
    }

    pub fn on_close(&self) {
        let _ = self.tx.send(TransportEvent::Close);
    }

    /// Whether the socket still listens to this transport.
    pub fn is_attached(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A bidirectional frame connection.
///
/// Implementations start connecting when constructed and must not block:
/// network work happens on tasks they spawn, and results come back through
/// the [`TransportHandler`].
pub trait Transport: Send {
    /// Send one serialized frame. Only called while the state is `Open`.
    fn send(&mut self, data: String);

    fn close(&mut self);

    fn connection_state(&self) -> ConnectionState;

    /// Transports that carry their own liveness checks opt out of the
    /// socket heartbeat.
    fn skip_heartbeat(&self) -> bool {
        false
    }
}

/// What a transport is constructed with.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Resolved socket endpoint.
    pub endpoint: String,
    /// Request timeout for transports that have one (long-poll).
    pub timeout: Duration,
}

type BuildFn = dyn Fn(TransportOptions, TransportHandler) -> Box<dyn Transport> + Send + Sync;

/// Constructor for the transport a socket uses.
#[derive(Clone)]
pub struct TransportFactory(Arc<BuildFn>);

impl TransportFactory {
    pub fn new(
        build: impl Fn(TransportOptions, TransportHandler) -> Box<dyn Transport> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(build))
    }

    pub fn websocket() -> Self {
        Self::new(|opts, handler| Box::new(websocket::WebSocket::connect(opts, handler)))
    }

    pub fn long_poll() -> Self {
        Self::new(|opts, handler| {
            let ajax = Arc::new(ajax::ReqwestAjax::new());
            Box::new(longpoll::LongPoller::new(opts, handler, ajax))
        })
    }

    /// Long-poll over a caller-supplied request primitive.
    pub fn long_poll_with(ajax: Arc<dyn Ajax>) -> Self {
        Self::new(move |opts, handler| {
            Box::new(longpoll::LongPoller::new(opts, handler, Arc::clone(&ajax)))
        })
    }

    pub fn build(&self, opts: TransportOptions, handler: TransportHandler) -> Box<dyn Transport> {
        (self.0)(opts, handler)
    }
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::websocket()
    }
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportFactory(..)")
    }
}
