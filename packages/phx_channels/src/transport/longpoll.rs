//! HTTP long-poll fallback transport.
//!
//! Protocol, against `<endpoint>/poll`:
//!
//! - `GET ?token=..&sig=..&format=json` answers `{status, token, sig, messages}`
//!   where `status` drives the poller:
//!   - `200`: messages are delivered, then poll again
//!   - `204`: nothing new, poll again
//!   - `410`: session established, the transport is open, poll again
//!   - `0` / `500`: failure, report the error and close for a retry
//!   - anything else: protocol violation, polling stops for good
//! - `POST` with a raw frame body and the same query; anything but a `200`
//!   status is a failure.
//!
//! A body that cannot be read counts as status `0`. A request timeout is a
//! failure as well.
//!
//! After a failure the poller is closed and left in the `Connecting` state;
//! the socket's reconnect builds a fresh poller which starts a new session.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ajax::{Ajax, AjaxOutcome, AjaxRequest, Method};
use super::{ConnectionState, SharedState, Transport, TransportHandler, TransportOptions};
use crate::endpoint::poll_endpoint;
use crate::error::PollError;
use crate::message::Message;

const ACCEPT_JSON: &str = "application/json";

#[derive(Debug, Default)]
struct Auth {
    token: Option<String>,
    sig: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: u16,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    sig: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
}

impl PollResponse {
    fn from_body(body: Option<Value>) -> Self {
        body.and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(PollResponse {
                status: 0,
                token: None,
                sig: None,
                messages: Vec::new(),
            })
    }
}

struct Shared {
    ajax: Arc<dyn Ajax>,
    poll_endpoint: String,
    timeout: std::time::Duration,
    state: SharedState,
    auth: Mutex<Auth>,
    handler: TransportHandler,
    cancel: CancellationToken,
}

impl Shared {
    async fn endpoint_url(&self) -> Result<String, PollError> {
        let mut url = reqwest::Url::parse(&self.poll_endpoint)
            .map_err(|e| PollError::InvalidEndpoint(format!("{}: {}", self.poll_endpoint, e)))?;
        let auth = self.auth.lock().await;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &auth.token {
                query.append_pair("token", token);
            }
            if let Some(sig) = &auth.sig {
                query.append_pair("sig", sig);
            }
            query.append_pair("format", "json");
        }
        Ok(url.into())
    }

    async fn remember_auth(&self, resp: &PollResponse) {
        let mut auth = self.auth.lock().await;
        if resp.token.is_some() {
            auth.token = resp.token.clone();
        }
        if resp.sig.is_some() {
            auth.sig = resp.sig.clone();
        }
    }

    fn request(&self, method: Method, url: String, body: Option<String>) -> AjaxRequest {
        AjaxRequest {
            method,
            url,
            accept: ACCEPT_JSON,
            body,
            timeout: self.timeout,
        }
    }

    fn close(&self) {
        self.state.set(ConnectionState::Closed);
        self.handler.on_close();
        self.cancel.cancel();
    }

    fn close_and_retry(&self) {
        self.close();
        self.state.set(ConnectionState::Connecting);
    }
}

/// Long-poll transport. Starts polling as soon as it is constructed.
pub struct LongPoller {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl LongPoller {
    pub fn new(opts: TransportOptions, handler: TransportHandler, ajax: Arc<dyn Ajax>) -> Self {
        let shared = Arc::new(Shared {
            ajax,
            poll_endpoint: poll_endpoint(&opts.endpoint),
            timeout: opts.timeout,
            state: SharedState::new(ConnectionState::Connecting),
            auth: Mutex::new(Auth::default()),
            handler,
            cancel: CancellationToken::new(),
        });
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let poller = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = poll_loop(&poller).await {
                error!("long poll stopped: {}", e);
                poller.state.set(ConnectionState::Closed);
                poller.handler.on_error(e.to_string());
                poller.cancel.cancel();
            }
        });
        tokio::spawn(send_loop(Arc::clone(&shared), outgoing_rx));

        Self { shared, outgoing }
    }

    pub fn poll_endpoint(&self) -> &str {
        &self.shared.poll_endpoint
    }
}

impl Transport for LongPoller {
    fn send(&mut self, data: String) {
        let _ = self.outgoing.send(data);
    }

    fn close(&mut self) {
        self.shared.close();
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn skip_heartbeat(&self) -> bool {
        true
    }
}

impl Drop for LongPoller {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn poll_loop(shared: &Shared) -> Result<(), PollError> {
    loop {
        if !matches!(
            shared.state.get(),
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            return Ok(());
        }

        let url = shared.endpoint_url().await?;
        let request = shared.ajax.request(shared.request(Method::Get, url, None));
        let outcome = tokio::select! {
            outcome = request => outcome,
            () = shared.cancel.cancelled() => return Ok(()),
        };

        let resp = match outcome {
            AjaxOutcome::TimedOut => {
                warn!("long poll timed out");
                shared.handler.on_error("timeout");
                shared.close_and_retry();
                return Ok(());
            }
            AjaxOutcome::Response(body) => PollResponse::from_body(body),
        };
        shared.remember_auth(&resp).await;

        match resp.status {
            200 => {
                for msg in &resp.messages {
                    shared.handler.on_message(msg.to_json());
                }
            }
            204 => {}
            410 => {
                debug!("long poll session established");
                shared.state.set(ConnectionState::Open);
                shared.handler.on_open();
            }
            0 | 500 => {
                warn!("long poll failed with status {}", resp.status);
                shared.handler.on_error(format!("poll status {}", resp.status));
                shared.close_and_retry();
                return Ok(());
            }
            other => return Err(PollError::UnhandledStatus(other)),
        }
    }
}

/// POSTs run one at a time so frames reach the server in send order.
async fn send_loop(shared: Arc<Shared>, mut outgoing: mpsc::UnboundedReceiver<String>) {
    loop {
        let body = tokio::select! {
            body = outgoing.recv() => match body {
                Some(body) => body,
                None => return,
            },
            () = shared.cancel.cancelled() => return,
        };

        let url = match shared.endpoint_url().await {
            Ok(url) => url,
            Err(e) => {
                error!("long poll send dropped: {}", e);
                shared.handler.on_error(e.to_string());
                continue;
            }
        };
        let request = shared.ajax.request(shared.request(Method::Post, url, Some(body)));
        let outcome = tokio::select! {
            outcome = request => outcome,
            () = shared.cancel.cancelled() => return,
        };

        let status = match outcome {
            AjaxOutcome::TimedOut => {
                warn!("long poll send timed out");
                shared.handler.on_error("timeout");
                shared.close_and_retry();
                return;
            }
            AjaxOutcome::Response(body) => PollResponse::from_body(body).status,
        };
        if status != 200 {
            warn!("long poll send failed with status {}", status);
            shared.handler.on_error(format!("send status {status}"));
            shared.close_and_retry();
            return;
        }
    }
}
