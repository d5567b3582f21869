//! Native WebSocket transport (tokio-tungstenite).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ConnectionState, SharedState, Transport, TransportHandler, TransportOptions};

enum Outgoing {
    Text(String),
    Close,
}

/// A WebSocket connection driven by its own I/O task.
///
/// The handle only queues frames; the task owns the stream. Dropping the
/// handle closes the connection.
pub struct WebSocket {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    state: Arc<SharedState>,
    cancel: CancellationToken,
}

impl WebSocket {
    pub fn connect(opts: TransportOptions, handler: TransportHandler) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SharedState::new(ConnectionState::Connecting));
        let cancel = CancellationToken::new();

        tokio::spawn(run_connection(
            opts.endpoint,
            handler,
            outgoing_rx,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Self {
            outgoing,
            state,
            cancel,
        }
    }
}

impl Transport for WebSocket {
    fn send(&mut self, data: String) {
        let _ = self.outgoing.send(Outgoing::Text(data));
    }

    fn close(&mut self) {
        match self.state.get() {
            ConnectionState::Connecting => {
                self.state.set(ConnectionState::Closing);
                self.cancel.cancel();
            }
            ConnectionState::Open => {
                self.state.set(ConnectionState::Closing);
                let _ = self.outgoing.send(Outgoing::Close);
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }
}

async fn run_connection(
    endpoint: String,
    handler: TransportHandler,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    state: Arc<SharedState>,
    cancel: CancellationToken,
) {
    let connect = tokio::select! {
        res = tokio_tungstenite::connect_async(&endpoint) => res,
        () = cancel.cancelled() => {
            state.set(ConnectionState::Closed);
            handler.on_close();
            return;
        }
    };

    let ws_stream = match connect {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!("websocket connect to {} failed: {}", endpoint, e);
            state.set(ConnectionState::Closed);
            handler.on_error(e.to_string());
            handler.on_close();
            return;
        }
    };

    debug!("websocket connected to {}", endpoint);
    state.set(ConnectionState::Open);
    handler.on_open();

    let (mut ws_write, mut ws_read) = ws_stream.split();
    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Text(data)) => {
                    if let Err(e) = ws_write.send(tungstenite::Message::Text(data.into())).await {
                        handler.on_error(e.to_string());
                        break;
                    }
                }
                // Close requested, or the handle was dropped.
                Some(Outgoing::Close) | None => {
                    state.set(ConnectionState::Closing);
                    let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                    break;
                }
            },

            msg = ws_read.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    handler.on_message(text.as_str());
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    handler.on_error(e.to_string());
                    break;
                }
            },
        }
    }

    state.set(ConnectionState::Closed);
    handler.on_close();
}
