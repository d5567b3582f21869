use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use phx_channels::Socket;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::FileConfig;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);
/// Frees the push when the server sends no reply.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for a `phx join` session.
pub struct JoinOptions {
    pub topic: String,
    /// Event name used for lines read from stdin.
    pub event: String,
    pub params: Map<String, Value>,
}

/// Join `topic`, print every inbound frame as a JSON line on stdout and push
/// each stdin line as `event`. Ends on EOF or Ctrl-C after a best-effort leave.
pub async fn join_command(config: &FileConfig, opts: JoinOptions) -> Result<()> {
    let socket = Socket::new(&config.endpoint, config.socket_config())
        .with_context(|| format!("invalid endpoint {}", config.endpoint))?;

    let endpoint = socket.endpoint().to_string();
    socket.on_open(move || info!("connected to {}", endpoint));
    socket.on_error(|reason| warn!("connection error: {}", reason));
    socket.on_close(|| warn!("connection closed, reconnecting"));

    let chan = socket.chan_with_observer(
        opts.topic.clone(),
        Value::Object(opts.params),
        |event, payload, msg_ref| {
            let line = json!({"event": event, "payload": payload, "ref": msg_ref});
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        },
    );
    chan.on_error(|_| warn!("channel errored, rejoining"));
    chan.on_close(|_| info!("channel closed"));

    let topic = opts.topic.clone();
    chan.join()?
        .receive("ok", move |_| info!("joined {}", topic))
        .receive("error", |resp| error!("join refused: {}", resp))
        .after(JOIN_TIMEOUT, || warn!("join timed out"))?;

    socket.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let event = opts.event.clone();
                let unanswered = event.clone();
                chan.push(event.clone(), line_payload(&line))?
                    .receive("error", move |resp| warn!("{} rejected: {}", event, resp))
                    .after(PUSH_TIMEOUT, move || debug!("no reply to {}", unanswered))?;
            }
            _ = &mut ctrl_c => break,
        }
    }

    let (done_tx, done_rx) = oneshot::channel();
    let mut done_tx = Some(done_tx);
    chan.leave()?.receive("ok", move |_| {
        if let Some(tx) = done_tx.take() {
            let _ = tx.send(());
        }
    });
    if tokio::time::timeout(LEAVE_TIMEOUT, done_rx).await.is_err() {
        warn!("leave not acknowledged within {:?}", LEAVE_TIMEOUT);
    }

    socket.disconnect();
    Ok(())
}

/// A stdin line that parses as a JSON object is sent as-is; anything else is
/// wrapped as `{"body": line}`.
fn line_payload(line: &str) -> Value {
    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "body": line }),
    }
}
