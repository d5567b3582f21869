use thiserror::Error;

/// Misuse of the channel API by the caller.
///
/// These are programming mistakes: the offending call is rejected before
/// anything is sent, and nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error(
        "tried to join '{topic}' multiple times; join can only be called a single time per channel instance"
    )]
    AlreadyJoined { topic: String },

    #[error("tried to push '{event}' to '{topic}' before joining; call join() before pushing events")]
    PushBeforeJoin { topic: String, event: String },

    #[error("only a single after hook can be applied to a push (event '{event}')")]
    AfterHookAlreadySet { event: String },
}

/// Errors raised while constructing a [`Socket`](crate::Socket).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The endpoint is relative (`/ws` or `//host/ws`) but no page origin
    /// was configured to resolve it against.
    #[error("endpoint '{0}' is relative and no origin is configured")]
    RelativeEndpoint(String),
}

/// Fatal long-poll failures. Recoverable failures never surface as a
/// `PollError`; they go through the transport's error and close events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// The server answered with a status the long-poll protocol does not
    /// define. Both ends disagree on the protocol, so polling stops.
    #[error("unhandled poll status {0}")]
    UnhandledStatus(u16),

    #[error("invalid poll endpoint: {0}")]
    InvalidEndpoint(String),
}
