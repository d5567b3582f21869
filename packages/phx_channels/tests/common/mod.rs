//! In-memory transport and request primitive for driving a socket by hand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use phx_channels::transport::ajax::{Ajax, AjaxOutcome, AjaxRequest, Method};
use phx_channels::{
    ConnectionState, Message, Socket, SocketConfig, Transport, TransportFactory, TransportHandler,
};
use serde_json::{Value, json};

/// Every transport the socket has built, in order.
#[derive(Default)]
pub struct MockNetwork {
    conns: Mutex<Vec<MockConn>>,
    skip_heartbeat: bool,
}

#[derive(Clone)]
pub struct MockConn {
    pub endpoint: String,
    handler: TransportHandler,
    sent: Arc<Mutex<Vec<String>>>,
    state: Arc<Mutex<ConnectionState>>,
}

struct MockTransport {
    conn: MockConn,
    skip_heartbeat: bool,
}

impl Transport for MockTransport {
    fn send(&mut self, data: String) {
        self.conn.sent.lock().unwrap().push(data);
    }

    fn close(&mut self) {
        *self.conn.state.lock().unwrap() = ConnectionState::Closed;
        self.conn.handler.on_close();
    }

    fn connection_state(&self) -> ConnectionState {
        *self.conn.state.lock().unwrap()
    }

    fn skip_heartbeat(&self) -> bool {
        self.skip_heartbeat
    }
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_heartbeat() -> Arc<Self> {
        Arc::new(Self {
            skip_heartbeat: true,
            ..Self::default()
        })
    }

    pub fn factory(self: &Arc<Self>) -> TransportFactory {
        let network = Arc::clone(self);
        TransportFactory::new(move |opts, handler| {
            let conn = MockConn {
                endpoint: opts.endpoint,
                handler,
                sent: Arc::default(),
                state: Arc::new(Mutex::new(ConnectionState::Connecting)),
            };
            network.conns.lock().unwrap().push(conn.clone());
            Box::new(MockTransport {
                conn,
                skip_heartbeat: network.skip_heartbeat,
            })
        })
    }

    /// A socket on this network. `config.transport` is replaced.
    pub fn socket(self: &Arc<Self>, config: SocketConfig) -> Socket {
        let config = SocketConfig {
            transport: self.factory(),
            ..config
        };
        Socket::new("ws://localhost:4000/socket", config).unwrap()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn conn(&self, idx: usize) -> MockConn {
        self.conns.lock().unwrap()[idx].clone()
    }

    pub fn last(&self) -> MockConn {
        self.conns.lock().unwrap().last().cloned().unwrap()
    }
}

impl MockConn {
    pub fn open(&self) {
        *self.state.lock().unwrap() = ConnectionState::Open;
        self.handler.on_open();
    }

    /// The server went away.
    pub fn drop_conn(&self) {
        *self.state.lock().unwrap() = ConnectionState::Closed;
        self.handler.on_close();
    }

    /// Connecting failed.
    pub fn refuse(&self) {
        *self.state.lock().unwrap() = ConnectionState::Closed;
        self.handler.on_error("connection refused");
        self.handler.on_close();
    }

    pub fn error(&self, reason: &str) {
        self.handler.on_error(reason);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn deliver(&self, frame: Value) {
        self.handler.on_message(frame.to_string());
    }

    /// Reply to a frame this connection carried.
    pub fn reply(&self, to: &Message, status: &str, response: Value) {
        self.deliver(json!({
            "topic": to.topic,
            "event": "phx_reply",
            "payload": {"status": status, "response": response},
            "ref": to.msg_ref,
        }));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|data| Message::from_json(data).unwrap())
            .collect()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.event).collect()
    }

    pub fn sent_with_event(&self, event: &str) -> Vec<Message> {
        self.sent().into_iter().filter(|m| m.event == event).collect()
    }

    pub fn last_with_event(&self, event: &str) -> Message {
        self.sent_with_event(event).pop().unwrap()
    }
}

/// Let spawned tasks run, then round-trip through the socket actor so
/// everything queued before this call has been handled.
pub async fn settle(socket: &Socket) {
    for _ in 0..2 {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        socket.connection_state().await;
    }
}

pub async fn advance(socket: &Socket, ms: u64) {
    tokio::time::advance(std::time::Duration::from_millis(ms)).await;
    settle(socket).await;
}

/// Connected socket plus its first connection.
pub async fn connected(network: &Arc<MockNetwork>, config: SocketConfig) -> (Socket, MockConn) {
    let socket = network.socket(config);
    socket.connect();
    settle(&socket).await;
    let conn = network.last();
    conn.open();
    settle(&socket).await;
    (socket, conn)
}

/// Records strings pushed from callbacks.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Scripted request primitive. Requests beyond the script never resolve.
#[derive(Default)]
pub struct MockAjax {
    gets: Mutex<VecDeque<AjaxOutcome>>,
    posts: Mutex<VecDeque<AjaxOutcome>>,
    requests: Mutex<Vec<AjaxRequest>>,
}

impl MockAjax {
    pub fn script_get(&self, body: Value) {
        self.gets
            .lock()
            .unwrap()
            .push_back(AjaxOutcome::Response(Some(body)));
    }

    pub fn script_post(&self, body: Value) {
        self.posts
            .lock()
            .unwrap()
            .push_back(AjaxOutcome::Response(Some(body)));
    }

    pub fn requests(&self) -> Vec<AjaxRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_with(&self, method: Method) -> Vec<AjaxRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }
}

impl Ajax for MockAjax {
    fn request(&self, req: AjaxRequest) -> BoxFuture<'static, AjaxOutcome> {
        let queue = match req.method {
            Method::Get => &self.gets,
            Method::Post => &self.posts,
        };
        let next = queue.lock().unwrap().pop_front();
        self.requests.lock().unwrap().push(req);
        match next {
            Some(outcome) => futures::future::ready(outcome).boxed(),
            None => futures::future::pending().boxed(),
        }
    }
}
