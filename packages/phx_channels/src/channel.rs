//! Topic subscriptions multiplexed over a socket.
//!
//! ```text
//! closed ──join──▶ joining ──ok──▶ joined
//!                     │               │
//!                     └──▶ errored ◀──┘     (transport error or phx_error)
//!                            │
//!                            └──rejoin──▶ joining
//!
//! joining / joined / errored ──leave ok or phx_close──▶ closed
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::ChannelError;
use crate::message::{ChannelEvent, JOIN, LEAVE, Reply};
use crate::push::{Push, PushId, PushKind, PushRecord};
use crate::socket::{Command, Socket, SocketActor};
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChannelId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Errored,
    Joining,
    Joined,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type Binding = Box<dyn FnMut(&Value) + Send>;

/// Sees every frame delivered to a channel, `(event, payload, ref)`, before
/// the event bindings run. It cannot stop delivery.
pub type MessageObserver = Box<dyn FnMut(&str, &Value, Option<&str>) + Send>;

/// Handle to a channel registered with a [`Socket`].
///
/// Dropping every handle does not leave the topic: a joined channel keeps
/// dispatching to its bindings until it is closed.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelId,
    topic: String,
    join_push: PushId,
    joined_once: AtomicBool,
    socket: Socket,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.socket.send(Command::ReleaseChannel(self.id));
    }
}

impl Channel {
    pub(crate) fn new(socket: Socket, id: ChannelId, topic: String, join_push: PushId) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                topic,
                join_push,
                joined_once: AtomicBool::new(false),
                socket,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Join the topic. Allowed once per channel; rejoins after errors happen
    /// on their own.
    pub fn join(&self) -> Result<Push, ChannelError> {
        if self.inner.joined_once.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyJoined {
                topic: self.inner.topic.clone(),
            });
        }
        self.inner.socket.send(Command::Join {
            channel: self.inner.id,
        });
        Ok(Push::new(
            self.inner.socket.clone(),
            self.inner.join_push,
            JOIN,
        ))
    }

    /// Push an event. Sent right away when the socket is connected and the
    /// channel joined, otherwise buffered until the next successful join.
    pub fn push(&self, event: impl Into<String>, payload: Value) -> Result<Push, ChannelError> {
        self.push_kind(event.into(), payload, PushKind::Message)
    }

    /// Leave the topic. The channel closes once the server acknowledges.
    pub fn leave(&self) -> Result<Push, ChannelError> {
        self.push_kind(
            LEAVE.to_string(),
            Value::Object(Map::new()),
            PushKind::Leave,
        )
    }

    fn push_kind(&self, event: String, payload: Value, kind: PushKind) -> Result<Push, ChannelError> {
        if !self.inner.joined_once.load(Ordering::Acquire) {
            return Err(ChannelError::PushBeforeJoin {
                topic: self.inner.topic.clone(),
                event,
            });
        }
        let socket = &self.inner.socket;
        let id = PushId(socket.next_id());
        socket.send(Command::Push {
            channel: self.inner.id,
            push: id,
            kind,
            event: event.clone(),
            payload,
        });
        Ok(Push::new(socket.clone(), id, event))
    }

    /// Bind `callback` to `event`. Several bindings per event are allowed and
    /// run in registration order.
    pub fn on(&self, event: impl AsRef<str>, callback: impl FnMut(&Value) + Send + 'static) {
        self.inner.socket.send(Command::On {
            channel: self.inner.id,
            event: ChannelEvent::from(event.as_ref()),
            callback: Box::new(callback),
        });
    }

    /// Remove every binding of `event`.
    pub fn off(&self, event: impl AsRef<str>) {
        self.inner.socket.send(Command::Off {
            channel: self.inner.id,
            event: ChannelEvent::from(event.as_ref()),
        });
    }

    pub fn on_close(&self, callback: impl FnMut(&Value) + Send + 'static) {
        self.on(ChannelEvent::Close.as_str(), callback);
    }

    pub fn on_error(&self, callback: impl FnMut(&Value) + Send + 'static) {
        self.on(ChannelEvent::Error.as_str(), callback);
    }

    pub async fn state(&self) -> ChannelState {
        let (tx, rx) = oneshot::channel();
        self.inner.socket.send(Command::ChannelState {
            channel: self.inner.id,
            respond_to: tx,
        });
        rx.await.unwrap_or(ChannelState::Closed)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .finish()
    }
}

/// Actor-side state of a channel.
pub(crate) struct ChannelRecord {
    pub(crate) topic: String,
    pub(crate) state: ChannelState,
    join_push: PushId,
    bindings: HashMap<ChannelEvent, Vec<Binding>>,
    /// Ref of each in-flight push to the push waiting for its reply.
    pub(crate) awaiting: HashMap<String, PushId>,
    buffer: VecDeque<PushId>,
    pub(crate) rejoin_timer: Timer,
    observer: Option<MessageObserver>,
    released: bool,
}

impl ChannelRecord {
    pub(crate) fn new(
        topic: String,
        join_push: PushId,
        rejoin_timer: Timer,
        observer: Option<MessageObserver>,
    ) -> Self {
        Self {
            topic,
            state: ChannelState::Closed,
            join_push,
            bindings: HashMap::new(),
            awaiting: HashMap::new(),
            buffer: VecDeque::new(),
            rejoin_timer,
            observer,
            released: false,
        }
    }
}

impl SocketActor {
    pub(crate) fn send_join(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.state = ChannelState::Joining;
        let join_push = channel.join_push;
        self.drop_orphaned_pushes(id);
        self.send_push(join_push);
    }

    pub(crate) fn rejoin_fired(&mut self, id: ChannelId, generation: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.rejoin_timer.fire(generation) {
            return;
        }
        // Keep retrying until a join succeeds; only a join ok resets the timer.
        channel.rejoin_timer.schedule();
        if self.is_connected() {
            self.send_join(id);
        }
    }

    pub(crate) fn channel_push(
        &mut self,
        id: ChannelId,
        push: PushId,
        kind: PushKind,
        event: String,
        payload: Value,
    ) {
        let connected = self.is_connected();
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let can_push = connected && channel.state == ChannelState::Joined;
        if !can_push {
            channel.buffer.push_back(push);
        }
        self.pushes
            .insert(push, PushRecord::new(id, kind, event, payload));
        if can_push {
            self.send_push(push);
        }
    }

    pub(crate) fn bind(&mut self, id: ChannelId, event: ChannelEvent, callback: Binding) {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.bindings.entry(event).or_default().push(callback);
        }
    }

    pub(crate) fn unbind(&mut self, id: ChannelId, event: &ChannelEvent) {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.bindings.remove(event);
        }
    }

    /// Deliver an event to a channel: observer first, then the channel's own
    /// handling of reserved events, then the bindings.
    pub(crate) fn trigger(
        &mut self,
        id: ChannelId,
        event: &str,
        payload: &Value,
        msg_ref: Option<&str>,
    ) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if let Some(observer) = channel.observer.as_mut() {
            observer(event, payload, msg_ref);
        }

        let key = ChannelEvent::from(event);
        match key {
            ChannelEvent::Close => self.channel_closed(id),
            ChannelEvent::Error => self.channel_error(id, payload),
            ChannelEvent::Reply => {
                let waiting = msg_ref.and_then(|r| channel.awaiting.remove(r));
                match (waiting, Reply::from_payload(payload)) {
                    (Some(push), Some(reply)) => self.push_replied(push, reply),
                    (Some(push), None) => {
                        // Not a reply envelope; keep waiting.
                        if let Some(r) = msg_ref {
                            channel.awaiting.insert(r.to_string(), push);
                        }
                    }
                    (None, _) => {}
                }
            }
            _ => {}
        }

        if let Some(bindings) = self
            .channels
            .get_mut(&id)
            .and_then(|c| c.bindings.get_mut(&key))
        {
            for callback in bindings.iter_mut() {
                callback(payload);
            }
        }
        self.maybe_collect_channel(id);
    }

    fn channel_closed(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.state = ChannelState::Closed;
        channel.rejoin_timer.reset();
        let msg = format!("close {}", channel.topic);
        self.live.retain(|c| *c != id);
        self.log("channel", &msg, &Value::Null);
    }

    fn channel_error(&mut self, id: ChannelId, reason: &Value) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        // A closed channel has nothing to rejoin.
        if channel.state == ChannelState::Closed {
            return;
        }
        channel.state = ChannelState::Errored;
        channel.rejoin_timer.schedule();
        let msg = format!("error {}", channel.topic);
        self.log("channel", &msg, reason);
    }

    /// Join ok: joined, fresh rejoin backoff, then the buffered pushes in
    /// enqueue order.
    pub(crate) fn channel_joined(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.state = ChannelState::Joined;
        channel.rejoin_timer.reset();
        let buffered: Vec<PushId> = channel.buffer.drain(..).collect();
        for push in buffered {
            self.send_push(push);
        }
    }

    pub(crate) fn release_channel(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.released = true;
        }
        self.maybe_collect_channel(id);
    }

    /// Forget a closed channel nobody holds anymore, with its pushes.
    fn maybe_collect_channel(&mut self, id: ChannelId) {
        let collect = self
            .channels
            .get(&id)
            .is_some_and(|c| c.released && c.state == ChannelState::Closed);
        if collect {
            self.channels.remove(&id);
            self.pushes.retain(|_, push| push.channel != id);
            self.live.retain(|c| *c != id);
        }
    }
}
