mod common;

use std::sync::Arc;

use common::{Log, MockAjax, advance, settle};
use phx_channels::transport::ajax::{Ajax, Method};
use phx_channels::{ConnectionState, Message, Socket, SocketConfig, TransportFactory};
use serde_json::json;

fn socket(ajax: &Arc<MockAjax>) -> Socket {
    let ajax: Arc<dyn Ajax> = ajax.clone();
    let config = SocketConfig {
        transport: TransportFactory::long_poll_with(ajax),
        ..SocketConfig::default()
    };
    Socket::new("ws://localhost:4000/socket", config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn upgrade_status_opens_the_socket_once_and_keeps_polling() {
    let ajax = Arc::new(MockAjax::default());
    ajax.script_get(json!({"status": 410, "token": "t1", "sig": "s1"}));
    let socket = socket(&ajax);
    let opens = Log::default();
    let l = opens.clone();
    socket.on_open(move || l.push("open"));

    socket.connect();
    settle(&socket).await;

    assert!(socket.is_connected().await);
    assert_eq!(opens.entries(), vec!["open"]);
    let gets = ajax.requests_with(Method::Get);
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[0].url, "http://localhost:4000/socket/poll?format=json");
    assert_eq!(
        gets[1].url,
        "http://localhost:4000/socket/poll?token=t1&sig=s1&format=json"
    );
}

#[tokio::test(start_paused = true)]
async fn server_error_reports_then_a_fresh_poller_retries() {
    let ajax = Arc::new(MockAjax::default());
    ajax.script_get(json!({"status": 500}));
    ajax.script_get(json!({"status": 410, "token": "t2", "sig": "s2"}));
    let socket = socket(&ajax);
    let log = Log::default();
    let l = log.clone();
    socket.on_error(move |_| l.push("error"));
    let l = log.clone();
    socket.on_close(move || l.push("close"));
    let l = log.clone();
    socket.on_open(move || l.push("open"));

    socket.connect();
    settle(&socket).await;
    assert_eq!(log.entries(), vec!["error", "close"]);
    assert_eq!(socket.connection_state().await, ConnectionState::Connecting);
    assert_eq!(ajax.requests_with(Method::Get).len(), 1);

    advance(&socket, 1000).await;
    assert_eq!(log.entries(), vec!["error", "close", "open"]);
    assert!(socket.is_connected().await);
    assert_eq!(ajax.requests_with(Method::Get).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn long_poll_skips_heartbeats_and_posts_frames() {
    let ajax = Arc::new(MockAjax::default());
    ajax.script_get(json!({"status": 410, "token": "t", "sig": "s"}));
    ajax.script_post(json!({"status": 200}));
    let socket = socket(&ajax);
    socket.connect();
    settle(&socket).await;

    advance(&socket, 90_000).await;
    assert!(ajax.requests_with(Method::Post).is_empty());

    socket.push(Message::new("rooms:1", "new_msg", json!({"body": "hi"}), Some("1".into())));
    settle(&socket).await;
    let posts = ajax.requests_with(Method::Post);
    assert_eq!(posts.len(), 1);
    let frame = Message::from_json(posts[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(frame.event, "new_msg");
    assert!(posts[0].url.contains("token=t&sig=s"));
}

#[tokio::test(start_paused = true)]
async fn polled_messages_reach_channels() {
    let ajax = Arc::new(MockAjax::default());
    ajax.script_get(json!({"status": 410, "token": "t", "sig": "s"}));
    let socket = socket(&ajax);
    let chan = socket.chan("rooms:1", json!({}));
    let log = Log::default();
    let l = log.clone();
    chan.on("new_msg", move |payload| l.push(payload["body"].as_str().unwrap_or("").to_string()));
    chan.join().unwrap();
    socket.connect();
    settle(&socket).await;

    // The join went out as a POST once the session opened.
    let posts = ajax.requests_with(Method::Post);
    assert_eq!(posts.len(), 1);
    let join = Message::from_json(posts[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(join.event, "phx_join");

    ajax.script_get(json!({
        "status": 200,
        "token": "t",
        "sig": "s",
        "messages": [
            {"topic": "rooms:1", "event": "new_msg", "payload": {"body": "one"}, "ref": null},
            {"topic": "rooms:1", "event": "new_msg", "payload": {"body": "two"}, "ref": null}
        ]
    }));
    // Replace the parked poll with a fresh session that reads the script.
    socket.connect();
    settle(&socket).await;
    assert_eq!(log.entries(), vec!["one", "two"]);
}
