//! Outgoing requests awaiting a correlated reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::channel::ChannelId;
use crate::error::ChannelError;
use crate::message::{CLOSE, Message, Reply};
use crate::socket::{Command, Internal, Socket, SocketActor};
use crate::timer::{Backoff, FireSink, Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PushId(pub(crate) u64);

pub(crate) type ReceiveCallback = Box<dyn FnMut(&Value) + Send>;
pub(crate) type AfterCallback = Box<dyn FnMut() + Send>;

/// Handle to one outgoing request.
///
/// Callbacks registered here run on the socket task once the reply (or the
/// after timeout) arrives.
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushInner>,
}

struct PushInner {
    id: PushId,
    event: String,
    after_set: AtomicBool,
    socket: Socket,
}

impl Drop for PushInner {
    fn drop(&mut self) {
        self.socket.send(Command::ReleasePush(self.id));
    }
}

impl Push {
    pub(crate) fn new(socket: Socket, id: PushId, event: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PushInner {
                id,
                event: event.into(),
                after_set: AtomicBool::new(false),
                socket,
            }),
        }
    }

    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Call `callback` with the reply's `response` when a reply with
    /// `status` arrives. Fires right away (on the socket task) if such a
    /// reply was already received.
    pub fn receive(
        &self,
        status: impl Into<String>,
        callback: impl FnMut(&Value) + Send + 'static,
    ) -> &Self {
        self.inner.socket.send(Command::Receive {
            push: self.inner.id,
            status: status.into(),
            callback: Box::new(callback),
        });
        self
    }

    /// Give up on the reply `after` the push is sent: the reply listener is
    /// removed and `callback` runs instead. Only one after hook per push.
    pub fn after(
        &self,
        after: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<&Self, ChannelError> {
        if self.inner.after_set.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AfterHookAlreadySet {
                event: self.inner.event.clone(),
            });
        }
        self.inner.socket.send(Command::After {
            push: self.inner.id,
            after,
            callback: Box::new(callback),
        });
        Ok(self)
    }
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Push")
            .field("id", &self.inner.id)
            .field("event", &self.inner.event)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushKind {
    Join,
    Leave,
    Message,
}

pub(crate) struct AfterHook {
    callback: AfterCallback,
    timer: Timer,
}

/// Actor-side state of a push.
pub(crate) struct PushRecord {
    pub(crate) channel: ChannelId,
    pub(crate) kind: PushKind,
    event: String,
    payload: Value,
    reply_ref: Option<String>,
    hooks: Vec<(String, ReceiveCallback)>,
    after: Option<AfterHook>,
    sent: bool,
    /// The reply listener is registered.
    listening: bool,
    received: Option<Reply>,
    /// Every handle is gone.
    released: bool,
}

impl PushRecord {
    pub(crate) fn new(channel: ChannelId, kind: PushKind, event: String, payload: Value) -> Self {
        Self {
            channel,
            kind,
            event,
            payload,
            reply_ref: None,
            hooks: Vec::new(),
            after: None,
            sent: false,
            listening: false,
            received: None,
            released: false,
        }
    }

    fn settled(&self) -> bool {
        self.sent && !self.listening
    }
}

impl SocketActor {
    /// Send (or re-send) a push under a fresh ref.
    pub(crate) fn send_push(&mut self, id: PushId) {
        let reference = self.refs.next();
        let Some(push) = self.pushes.get_mut(&id) else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&push.channel) else {
            return;
        };

        if let Some(old) = push.reply_ref.replace(reference.clone()) {
            channel.awaiting.remove(&old);
        }
        channel.awaiting.insert(reference.clone(), id);
        push.received = None;
        push.listening = true;
        push.sent = true;
        if let Some(after) = push.after.as_mut() {
            after.timer.schedule();
        }

        let msg = Message::new(
            channel.topic.clone(),
            push.event.clone(),
            push.payload.clone(),
            Some(reference),
        );
        self.push(msg);
    }

    pub(crate) fn register_receive(&mut self, id: PushId, status: String, mut callback: ReceiveCallback) {
        let Some(push) = self.pushes.get_mut(&id) else {
            return;
        };
        if let Some(reply) = &push.received {
            if reply.status == status {
                callback(&reply.response);
            }
        }
        push.hooks.push((status, callback));
    }

    pub(crate) fn register_after(&mut self, id: PushId, after: Duration, callback: AfterCallback) {
        let Some(push) = self.pushes.get_mut(&id) else {
            return;
        };
        let tx = self.internal_tx.clone();
        let sink: FireSink = Arc::new(move |generation| {
            let _ = tx.send(Internal::After { push: id, generation });
        });
        let mut timer = Timer::new(Backoff::constant(after), sink);
        // A push that already has its reply never times out.
        if push.sent && push.listening {
            timer.schedule();
        }
        push.after = Some(AfterHook { callback, timer });
    }

    pub(crate) fn push_replied(&mut self, id: PushId, reply: Reply) {
        let Some(push) = self.pushes.get_mut(&id) else {
            return;
        };
        push.listening = false;
        push.received = Some(reply.clone());
        if let Some(after) = push.after.as_mut() {
            after.timer.cancel();
        }
        let kind = push.kind;
        let channel = push.channel;
        let ok = reply.status == "ok";

        if kind == PushKind::Join && ok {
            self.channel_joined(channel);
        }

        if let Some(push) = self.pushes.get_mut(&id) {
            for (status, callback) in push.hooks.iter_mut() {
                if *status == reply.status {
                    callback(&reply.response);
                }
            }
        }

        if kind == PushKind::Leave && ok {
            self.trigger(channel, CLOSE, &Value::String("leave".to_string()), None);
        }
        self.maybe_collect_push(id);
    }

    pub(crate) fn after_fired(&mut self, id: PushId, generation: u64) {
        let Some(push) = self.pushes.get_mut(&id) else {
            return;
        };
        let Some(after) = push.after.as_mut() else {
            return;
        };
        if !after.timer.fire(generation) {
            return;
        }
        debug!("push {} timed out", push.event);

        if push.listening {
            push.listening = false;
            if let (Some(reference), Some(channel)) =
                (&push.reply_ref, self.channels.get_mut(&push.channel))
            {
                channel.awaiting.remove(reference);
            }
        }
        (after.callback)();
        self.maybe_collect_push(id);
    }

    pub(crate) fn release_push(&mut self, id: PushId) {
        if let Some(push) = self.pushes.get_mut(&id) {
            push.released = true;
        }
        self.maybe_collect_push(id);
    }

    /// A rejoin talks to a fresh server-side channel, so replies to earlier
    /// refs never come. Released pushes still waiting on one are dropped;
    /// pushes with a live handle or an after hook stay until they settle.
    pub(crate) fn drop_orphaned_pushes(&mut self, channel: ChannelId) {
        let orphaned: Vec<PushId> = self
            .pushes
            .iter()
            .filter(|(_, p)| {
                p.channel == channel
                    && p.kind != PushKind::Join
                    && p.released
                    && p.listening
                    && p.after.is_none()
            })
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            let Some(push) = self.pushes.remove(&id) else {
                continue;
            };
            if let (Some(reference), Some(chan)) = (push.reply_ref, self.channels.get_mut(&channel)) {
                chan.awaiting.remove(&reference);
            }
        }
    }

    /// Drop a push nobody can observe anymore. Join pushes live as long as
    /// their channel since rejoins re-send them.
    fn maybe_collect_push(&mut self, id: PushId) {
        let collect = self
            .pushes
            .get(&id)
            .is_some_and(|p| p.released && p.kind != PushKind::Join && p.settled());
        if collect {
            self.pushes.remove(&id);
        }
    }
}
