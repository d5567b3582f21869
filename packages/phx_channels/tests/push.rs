mod common;

use std::time::Duration;

use common::{Log, MockConn, MockNetwork, advance, connected, settle};
use phx_channels::{Channel, ChannelError, Socket, SocketConfig};
use serde_json::json;

async fn joined(network: &std::sync::Arc<MockNetwork>) -> (Socket, MockConn, Channel) {
    let (socket, conn) = connected(network, SocketConfig::default()).await;
    let chan = socket.chan("room:1", json!({}));
    chan.join().unwrap();
    settle(&socket).await;
    conn.reply(&conn.last_with_event("phx_join"), "ok", json!({}));
    settle(&socket).await;
    (socket, conn, chan)
}

#[tokio::test(start_paused = true)]
async fn replies_dispatch_by_status_in_registration_order() {
    let network = MockNetwork::new();
    let (socket, conn, chan) = joined(&network).await;
    let log = Log::default();

    let push = chan.push("new_msg", json!({"body": "hi"})).unwrap();
    let (a, b, c) = (log.clone(), log.clone(), log.clone());
    push.receive("ok", move |resp| a.push(format!("ok1:{}", resp["id"])))
        .receive("error", move |_| b.push("error"))
        .receive("ok", move |resp| c.push(format!("ok2:{}", resp["id"])));
    settle(&socket).await;

    conn.reply(&conn.last_with_event("new_msg"), "ok", json!({"id": 7}));
    settle(&socket).await;
    assert_eq!(log.entries(), vec!["ok1:7", "ok2:7"]);
}

#[tokio::test(start_paused = true)]
async fn error_replies_are_routed_not_raised() {
    let network = MockNetwork::new();
    let (socket, conn, chan) = joined(&network).await;
    let log = Log::default();
    let errors = Log::default();
    let l = errors.clone();
    chan.on_error(move |_| l.push("channel error"));

    let (ok, err) = (log.clone(), log.clone());
    chan.push("new_msg", json!({}))
        .unwrap()
        .receive("ok", move |_| ok.push("ok"))
        .receive("error", move |resp| err.push(format!("error:{}", resp["reason"])));
    settle(&socket).await;

    conn.reply(&conn.last_with_event("new_msg"), "error", json!({"reason": "denied"}));
    settle(&socket).await;
    assert_eq!(log.entries(), vec![r#"error:"denied""#]);
    assert!(errors.entries().is_empty());
    assert!(socket.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn late_receive_fires_with_the_cached_reply() {
    let network = MockNetwork::new();
    let (socket, conn) = connected(&network, SocketConfig::default()).await;
    let chan = socket.chan("room:1", json!({}));
    let join = chan.join().unwrap();
    settle(&socket).await;
    conn.reply(&conn.last_with_event("phx_join"), "ok", json!({"session": "s1"}));
    settle(&socket).await;

    let log = Log::default();
    let (ok, err) = (log.clone(), log.clone());
    join.receive("error", move |_| err.push("error"));
    join.receive("ok", move |resp| ok.push(format!("ok:{}", resp["session"])));
    settle(&socket).await;
    assert_eq!(log.entries(), vec![r#"ok:"s1""#]);
}

#[tokio::test(start_paused = true)]
async fn after_hook_fires_when_no_reply_comes_and_drops_the_late_reply() {
    let network = MockNetwork::new();
    let (socket, conn, chan) = joined(&network).await;
    let log = Log::default();

    let push = chan.push("slow", json!({})).unwrap();
    let (ok, timeout) = (log.clone(), log.clone());
    push.receive("ok", move |_| ok.push("ok"));
    push.after(Duration::from_millis(5000), move || timeout.push("timeout"))
        .unwrap();
    settle(&socket).await;

    advance(&socket, 4999).await;
    assert!(log.entries().is_empty());
    advance(&socket, 1).await;
    assert_eq!(log.entries(), vec!["timeout"]);

    conn.reply(&conn.last_with_event("slow"), "ok", json!({}));
    settle(&socket).await;
    assert_eq!(log.entries(), vec!["timeout"]);
}

#[tokio::test(start_paused = true)]
async fn reply_cancels_the_after_hook() {
    let network = MockNetwork::new();
    let (socket, conn, chan) = joined(&network).await;
    let log = Log::default();

    let (ok, timeout) = (log.clone(), log.clone());
    let push = chan.push("fast", json!({})).unwrap();
    push.receive("ok", move |_| ok.push("ok"))
        .after(Duration::from_millis(5000), move || timeout.push("timeout"))
        .unwrap();
    settle(&socket).await;

    advance(&socket, 1000).await;
    conn.reply(&conn.last_with_event("fast"), "ok", json!({}));
    settle(&socket).await;
    advance(&socket, 10_000).await;
    assert_eq!(log.entries(), vec!["ok"]);
}

#[tokio::test(start_paused = true)]
async fn after_registered_once_replied_never_fires() {
    let network = MockNetwork::new();
    let (socket, conn, chan) = joined(&network).await;
    let log = Log::default();

    let push = chan.push("fast", json!({})).unwrap();
    settle(&socket).await;
    conn.reply(&conn.last_with_event("fast"), "ok", json!({}));
    settle(&socket).await;

    let timeout = log.clone();
    push.after(Duration::from_millis(100), move || timeout.push("timeout"))
        .unwrap();
    advance(&socket, 1000).await;
    assert!(log.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_after_hook_is_rejected() {
    let network = MockNetwork::new();
    let (_socket, _conn, chan) = joined(&network).await;

    let push = chan.push("new_msg", json!({})).unwrap();
    push.after(Duration::from_millis(100), || {}).unwrap();
    let err = push.after(Duration::from_millis(200), || {}).unwrap_err();
    assert_eq!(
        err,
        ChannelError::AfterHookAlreadySet {
            event: "new_msg".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn after_timer_starts_when_a_buffered_push_is_sent() {
    let network = MockNetwork::new();
    let (socket, conn) = connected(&network, SocketConfig::default()).await;
    let chan = socket.chan("room:1", json!({}));
    chan.join().unwrap();
    let log = Log::default();
    let timeout = log.clone();
    let push = chan.push("queued", json!({})).unwrap();
    push.after(Duration::from_millis(1000), move || timeout.push("timeout"))
        .unwrap();
    settle(&socket).await;

    // Still buffered behind the join: no clock running.
    advance(&socket, 5000).await;
    assert!(log.entries().is_empty());

    conn.reply(&conn.last_with_event("phx_join"), "ok", json!({}));
    settle(&socket).await;
    assert_eq!(conn.sent_events(), vec!["phx_join", "queued"]);
    advance(&socket, 999).await;
    assert!(log.entries().is_empty());
    advance(&socket, 1).await;
    assert_eq!(log.entries(), vec!["timeout"]);
}

#[tokio::test(start_paused = true)]
async fn join_after_hook_covers_each_attempt() {
    let network = MockNetwork::new();
    let (socket, conn) = connected(&network, SocketConfig::default()).await;
    let chan = socket.chan("room:1", json!({}));
    let log = Log::default();
    let timeout = log.clone();
    chan.join()
        .unwrap()
        .after(Duration::from_millis(3000), move || timeout.push("join timeout"))
        .unwrap();
    settle(&socket).await;

    advance(&socket, 3000).await;
    assert_eq!(log.entries(), vec!["join timeout"]);
    // The timed out join is not answered later.
    conn.reply(&conn.last_with_event("phx_join"), "ok", json!({}));
    settle(&socket).await;
    assert_eq!(chan.state().await, phx_channels::ChannelState::Joining);
}
