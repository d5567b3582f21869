//! Client for Phoenix-style channels: many topic subscriptions multiplexed
//! over one persistent connection.
//!
//! - [`Socket`] owns the connection. It buffers frames while disconnected,
//!   reconnects with backoff and sends heartbeats.
//! - [`Channel`] is one topic. It joins explicitly, rejoins on its own after
//!   errors and buffers pushes until joined.
//! - [`Push`] is one request; replies are matched by ref and dispatched by
//!   status, with an optional timeout.
//!
//! The connection is pluggable through [`TransportFactory`]: a WebSocket by
//! default, or the HTTP long-poll fallback.

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod push;
pub mod socket;
pub mod timer;
pub mod transport;

pub use channel::{Channel, ChannelState, MessageObserver};
pub use endpoint::Origin;
pub use error::{ChannelError, PollError, SocketError};
pub use message::{Message, Reply};
pub use push::Push;
pub use socket::{Logger, Socket, SocketConfig};
pub use timer::Backoff;
pub use transport::{
    ConnectionState, Transport, TransportEvent, TransportFactory, TransportHandler,
    TransportOptions,
};
