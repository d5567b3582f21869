//! The socket: one transport connection shared by every channel.
//!
//! All socket, channel and push state lives in one actor running on its own
//! task. [`Socket`], [`Channel`] and [`crate::Push`] are handles that queue
//! commands to it, so they can be used from inside any callback. Callbacks
//! run on the actor task, one event at a time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::channel::{Binding, Channel, ChannelId, ChannelRecord, ChannelState, MessageObserver};
use crate::endpoint::{Origin, expand_endpoint};
use crate::error::SocketError;
use crate::message::{ChannelEvent, ERROR, JOIN, Message, RefCounter};
use crate::push::{AfterCallback, PushId, PushKind, PushRecord, ReceiveCallback};
use crate::timer::{Backoff, FireSink, Timer};
use crate::transport::{
    ConnectionState, Transport, TransportEvent, TransportFactory, TransportHandler,
    TransportOptions,
};

/// Used when the configured heartbeat interval is zero.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

/// Diagnostic sink called with `(kind, msg, data)`.
pub type Logger = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

#[derive(Clone)]
pub struct SocketConfig {
    pub transport: TransportFactory,
    /// Zero means the 30 s default.
    pub heartbeat_interval: Duration,
    /// Delay before each reconnect attempt. Channels use the same curve for
    /// their rejoins.
    pub reconnect_after: Backoff,
    pub logger: Option<Logger>,
    pub longpoller_timeout: Duration,
    /// Default params of every channel; per-channel params win.
    pub params: Map<String, Value>,
    /// Page origin used to resolve relative endpoints.
    pub origin: Option<Origin>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            transport: TransportFactory::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_after: Backoff::default(),
            logger: None,
            longpoller_timeout: Duration::from_millis(20_000),
            params: Map::new(),
            origin: None,
        }
    }
}

impl fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConfig")
            .field("transport", &self.transport)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnect_after", &self.reconnect_after)
            .field("logger", &self.logger.is_some())
            .field("longpoller_timeout", &self.longpoller_timeout)
            .field("params", &self.params)
            .field("origin", &self.origin)
            .finish()
    }
}

type OpenHook = Box<dyn FnMut() + Send>;
type ErrorHook = Box<dyn FnMut(&str) + Send>;
type MessageHook = Box<dyn FnMut(&Message) + Send>;

/// Commands sent from handles to the socket actor
pub(crate) enum Command {
    Connect,
    Disconnect,
    Chan {
        channel: ChannelId,
        join_push: PushId,
        topic: String,
        params: Map<String, Value>,
        observer: Option<MessageObserver>,
    },
    Join {
        channel: ChannelId,
    },
    Push {
        channel: ChannelId,
        push: PushId,
        kind: PushKind,
        event: String,
        payload: Value,
    },
    On {
        channel: ChannelId,
        event: ChannelEvent,
        callback: Binding,
    },
    Off {
        channel: ChannelId,
        event: ChannelEvent,
    },
    Receive {
        push: PushId,
        status: String,
        callback: ReceiveCallback,
    },
    After {
        push: PushId,
        after: Duration,
        callback: AfterCallback,
    },
    SocketPush(Message),
    OnOpen(OpenHook),
    OnClose(OpenHook),
    OnError(ErrorHook),
    OnMessage(MessageHook),
    ConnectionState {
        respond_to: oneshot::Sender<ConnectionState>,
    },
    ChannelState {
        channel: ChannelId,
        respond_to: oneshot::Sender<ChannelState>,
    },
    ReleaseChannel(ChannelId),
    ReleasePush(PushId),
}

/// Timer wake-ups, tagged with the generation they were scheduled under.
#[derive(Debug)]
pub(crate) enum Internal {
    Reconnect { generation: u64 },
    Rejoin { channel: ChannelId, generation: u64 },
    After { push: PushId, generation: u64 },
}

/// Handle to a socket. Cheap to clone.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use phx_channels::{Socket, SocketConfig};
/// use serde_json::json;
///
/// let socket = Socket::new("ws://localhost:4000/socket/websocket", SocketConfig::default())?;
/// socket.connect();
///
/// let chan = socket.chan("rooms:lobby", json!({"user": "ada"}));
/// chan.on("new_msg", |payload| println!("{payload}"));
/// chan.join()?
///     .receive("ok", |_| println!("joined"))
///     .receive("error", |resp| eprintln!("join failed: {resp}"));
/// chan.push("new_msg", json!({"body": "hello"}))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

struct SocketShared {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    endpoint: String,
}

impl Socket {
    /// Create a socket and start its actor. Must be called from within a
    /// tokio runtime. Nothing is connected until [`Socket::connect`].
    pub fn new(endpoint: &str, config: SocketConfig) -> Result<Self, SocketError> {
        let endpoint = expand_endpoint(endpoint, config.origin.as_ref())?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let actor = SocketActor::new(endpoint.clone(), config, commands_rx);
        tokio::spawn(actor.run());

        Ok(Self {
            shared: Arc::new(SocketShared {
                commands,
                next_id: AtomicU64::new(0),
                endpoint,
            }),
        })
    }

    pub(crate) fn send(&self, cmd: Command) {
        let _ = self.shared.commands.send(cmd);
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The resolved endpoint.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Replace the current transport (if any) with a fresh connection.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the transport without reconnecting. Live channels go to the
    /// errored state and rejoin after the next `connect`.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Register a channel for `topic`. `params` (a JSON object) is merged
    /// over the socket's default params. The channel is not joined.
    pub fn chan(&self, topic: impl Into<String>, params: Value) -> Channel {
        self.chan_inner(topic.into(), params, None)
    }

    /// Like [`Socket::chan`], with an observer that sees every frame the
    /// channel receives before its bindings do.
    pub fn chan_with_observer(
        &self,
        topic: impl Into<String>,
        params: Value,
        observer: impl FnMut(&str, &Value, Option<&str>) + Send + 'static,
    ) -> Channel {
        self.chan_inner(topic.into(), params, Some(Box::new(observer)))
    }

    fn chan_inner(&self, topic: String, params: Value, observer: Option<MessageObserver>) -> Channel {
        let channel = ChannelId(self.next_id());
        let join_push = PushId(self.next_id());
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                warn!("channel params for {} must be an object, got {}", topic, other);
                Map::new()
            }
        };
        self.send(Command::Chan {
            channel,
            join_push,
            topic: topic.clone(),
            params,
            observer,
        });
        Channel::new(self.clone(), channel, topic, join_push)
    }

    /// Send a raw frame, buffered while disconnected.
    pub fn push(&self, msg: Message) {
        self.send(Command::SocketPush(msg));
    }

    pub fn on_open(&self, callback: impl FnMut() + Send + 'static) {
        self.send(Command::OnOpen(Box::new(callback)));
    }

    pub fn on_close(&self, callback: impl FnMut() + Send + 'static) {
        self.send(Command::OnClose(Box::new(callback)));
    }

    pub fn on_error(&self, callback: impl FnMut(&str) + Send + 'static) {
        self.send(Command::OnError(Box::new(callback)));
    }

    /// Observe every inbound frame, after channel dispatch.
    pub fn on_message(&self, callback: impl FnMut(&Message) + Send + 'static) {
        self.send(Command::OnMessage(Box::new(callback)));
    }

    pub async fn connection_state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ConnectionState { respond_to: tx });
        rx.await.unwrap_or(ConnectionState::Closed)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Open
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint", &self.shared.endpoint)
            .finish()
    }
}

#[derive(Default)]
struct SocketHooks {
    open: Vec<OpenHook>,
    close: Vec<OpenHook>,
    error: Vec<ErrorHook>,
    message: Vec<MessageHook>,
}

pub(crate) struct SocketActor {
    endpoint: String,
    config: SocketConfig,
    conn: Option<Box<dyn Transport>>,
    conn_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pub(crate) channels: HashMap<ChannelId, ChannelRecord>,
    /// Channels receiving frames, in creation order.
    pub(crate) live: Vec<ChannelId>,
    pub(crate) pushes: HashMap<PushId, PushRecord>,
    send_buffer: VecDeque<Message>,
    pub(crate) refs: RefCounter,
    reconnect_timer: Timer,
    heartbeat: Option<Interval>,
    hooks: SocketHooks,
    commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl SocketActor {
    fn new(
        endpoint: String,
        config: SocketConfig,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let tx = internal_tx.clone();
        let sink: FireSink = Arc::new(move |generation| {
            let _ = tx.send(Internal::Reconnect { generation });
        });
        let reconnect_timer = Timer::new(config.reconnect_after.clone(), sink);

        Self {
            endpoint,
            config,
            conn: None,
            conn_events: None,
            channels: HashMap::new(),
            live: Vec::new(),
            pushes: HashMap::new(),
            send_buffer: VecDeque::new(),
            refs: RefCounter::default(),
            reconnect_timer,
            heartbeat: None,
            hooks: SocketHooks::default(),
            commands,
            internal_tx,
            internal_rx,
        }
    }

    async fn run(mut self) {
        debug!("socket actor for {} started", self.endpoint);

        loop {
            tokio::select! {
                biased;

                Some(event) = self.internal_rx.recv() => self.handle_internal(event),

                event = next_transport_event(&mut self.conn_events) => {
                    self.handle_transport_event(event);
                }

                () = heartbeat_tick(&mut self.heartbeat) => self.send_heartbeat(),

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
            }
        }

        self.disconnect_transport();
        debug!("socket actor for {} stopped", self.endpoint);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Chan {
                channel,
                join_push,
                topic,
                params,
                observer,
            } => self.add_channel(channel, join_push, topic, params, observer),
            Command::Join { channel } => self.send_join(channel),
            Command::Push {
                channel,
                push,
                kind,
                event,
                payload,
            } => self.channel_push(channel, push, kind, event, payload),
            Command::On {
                channel,
                event,
                callback,
            } => self.bind(channel, event, callback),
            Command::Off { channel, event } => self.unbind(channel, &event),
            Command::Receive {
                push,
                status,
                callback,
            } => self.register_receive(push, status, callback),
            Command::After {
                push,
                after,
                callback,
            } => self.register_after(push, after, callback),
            Command::SocketPush(msg) => self.push(msg),
            Command::OnOpen(hook) => self.hooks.open.push(hook),
            Command::OnClose(hook) => self.hooks.close.push(hook),
            Command::OnError(hook) => self.hooks.error.push(hook),
            Command::OnMessage(hook) => self.hooks.message.push(hook),
            Command::ConnectionState { respond_to } => {
                let _ = respond_to.send(self.connection_state());
            }
            Command::ChannelState {
                channel,
                respond_to,
            } => {
                let state = self
                    .channels
                    .get(&channel)
                    .map_or(ChannelState::Closed, |c| c.state);
                let _ = respond_to.send(state);
            }
            Command::ReleaseChannel(channel) => self.release_channel(channel),
            Command::ReleasePush(push) => self.release_push(push),
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Reconnect { generation } => {
                if self.reconnect_timer.fire(generation) {
                    self.log(
                        "transport",
                        &format!("reconnect attempt {}", self.reconnect_timer.tries()),
                        &Value::Null,
                    );
                    self.connect();
                }
            }
            Internal::Rejoin {
                channel,
                generation,
            } => self.rejoin_fired(channel, generation),
            Internal::After { push, generation } => self.after_fired(push, generation),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_conn_open(),
            TransportEvent::Error(reason) => self.on_conn_error(&reason),
            TransportEvent::Message(data) => self.on_conn_message(&data),
            TransportEvent::Close => self.on_conn_close(),
        }
    }

    fn connect(&mut self) {
        self.disconnect_transport();
        let (handler, events) = TransportHandler::channel();
        let opts = TransportOptions {
            endpoint: self.endpoint.clone(),
            timeout: self.config.longpoller_timeout,
        };
        self.conn = Some(self.config.transport.build(opts, handler));
        self.conn_events = Some(events);
    }

    fn disconnect(&mut self) {
        let was_connected = self.conn.is_some();
        self.disconnect_transport();
        self.reconnect_timer.reset();
        if was_connected {
            self.trigger_chan_error(&Value::String("disconnect".to_string()));
        }
    }

    /// Detach the current transport, then close it. Dropping the event
    /// receiver first keeps the close from reaching this actor.
    fn disconnect_transport(&mut self) {
        self.conn_events = None;
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.heartbeat = None;
    }

    fn connection_state(&self) -> ConnectionState {
        self.conn
            .as_ref()
            .map_or(ConnectionState::Closed, |conn| conn.connection_state())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    fn add_channel(
        &mut self,
        id: ChannelId,
        join_push: PushId,
        topic: String,
        params: Map<String, Value>,
        observer: Option<MessageObserver>,
    ) {
        let mut merged = self.config.params.clone();
        merged.extend(params);

        let tx = self.internal_tx.clone();
        let sink: FireSink = Arc::new(move |generation| {
            let _ = tx.send(Internal::Rejoin {
                channel: id,
                generation,
            });
        });
        let rejoin_timer = Timer::new(self.config.reconnect_after.clone(), sink);

        self.pushes.insert(
            join_push,
            PushRecord::new(id, PushKind::Join, JOIN.to_string(), Value::Object(merged)),
        );
        self.channels.insert(
            id,
            ChannelRecord::new(topic, join_push, rejoin_timer, observer),
        );
        self.live.push(id);
    }

    /// Send a frame now, or buffer it until the transport opens.
    pub(crate) fn push(&mut self, msg: Message) {
        let reference = msg.msg_ref.as_deref().unwrap_or("");
        self.log(
            "push",
            &format!("{} {} ({})", msg.topic, msg.event, reference),
            &msg.payload,
        );
        if self.is_connected() {
            if let Some(conn) = self.conn.as_mut() {
                conn.send(msg.to_json());
            }
        } else {
            self.send_buffer.push_back(msg);
        }
    }

    fn flush_send_buffer(&mut self) {
        if !self.is_connected() {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            for msg in self.send_buffer.drain(..) {
                conn.send(msg.to_json());
            }
        }
    }

    fn send_heartbeat(&mut self) {
        let reference = self.refs.next();
        self.push(Message::heartbeat(reference));
    }

    fn trigger_chan_error(&mut self, reason: &Value) {
        for id in self.live.clone() {
            self.trigger(id, ERROR, reason, None);
        }
    }

    fn on_conn_open(&mut self) {
        self.log(
            "transport",
            &format!("connected to {}", self.endpoint),
            &Value::Null,
        );
        self.flush_send_buffer();
        self.reconnect_timer.reset();
        let skip = self.conn.as_ref().is_none_or(|conn| conn.skip_heartbeat());
        if !skip {
            let mut period = self.config.heartbeat_interval;
            if period.is_zero() {
                period = DEFAULT_HEARTBEAT_INTERVAL;
            }
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.heartbeat = Some(interval);
        }
        for hook in self.hooks.open.iter_mut() {
            hook();
        }
    }

    fn on_conn_close(&mut self) {
        self.log("transport", "close", &Value::Null);
        self.trigger_chan_error(&Value::Null);
        self.heartbeat = None;
        self.reconnect_timer.schedule();
        for hook in self.hooks.close.iter_mut() {
            hook();
        }
    }

    fn on_conn_error(&mut self, reason: &str) {
        warn!("transport error on {}: {}", self.endpoint, reason);
        self.log("transport", reason, &Value::Null);
        self.trigger_chan_error(&Value::String(reason.to_string()));
        for hook in self.hooks.error.iter_mut() {
            hook(reason);
        }
    }

    fn on_conn_message(&mut self, data: &str) {
        let msg = match Message::from_json(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        };

        let status = msg
            .payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("");
        let reference = msg
            .msg_ref
            .as_deref()
            .map(|r| format!("({r})"))
            .unwrap_or_default();
        self.log(
            "receive",
            &format!("{} {} {} {}", status, msg.topic, msg.event, reference),
            &msg.payload,
        );

        let members: Vec<ChannelId> = self
            .live
            .iter()
            .copied()
            .filter(|id| self.channels.get(id).is_some_and(|c| c.topic == msg.topic))
            .collect();
        for id in members {
            self.trigger(id, &msg.event, &msg.payload, msg.msg_ref.as_deref());
        }

        for hook in self.hooks.message.iter_mut() {
            hook(&msg);
        }
    }

    pub(crate) fn log(&self, kind: &str, msg: &str, data: &Value) {
        debug!(kind, "{}", msg);
        if let Some(logger) = &self.config.logger {
            logger(kind, msg, data);
        }
    }
}

/// Next event of the attached transport. Pends while none is attached, or
/// once the transport is gone.
async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    if let Some(rx) = events {
        if let Some(event) = rx.recv().await {
            return event;
        }
        *events = None;
    }
    std::future::pending().await
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
