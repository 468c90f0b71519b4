//! End-to-end tests against a real WebSocket peer on localhost.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use marblebar_client::registry::EventHandlers;
use marblebar_client::{
    ConnectionHooks, ConnectionManager, ConnectionState, ReplyTimeout, ResponseSpec,
};
use marblebar_core::ClientError;
use marblebar_settings::ClientSettings;

const TIMEOUT: Duration = Duration::from_secs(5);

type PeerStream = WebSocketStream<TcpStream>;

/// Bind a listener and return it with its `ws://` URL.
async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{addr}"))
}

async fn accept(listener: &TcpListener) -> PeerStream {
    let (stream, _) = timeout(TIMEOUT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_json(peer: &mut PeerStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, peer.next())
            .await
            .expect("peer read timed out")
            .expect("peer stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(peer: &mut PeerStream, value: Value) {
    peer.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn manager_for(endpoint: String) -> ConnectionManager {
    ConnectionManager::new(ClientSettings {
        endpoint,
        ..ClientSettings::default()
    })
}

async fn connect_pair() -> (ConnectionManager, PeerStream) {
    let (listener, url) = bind().await;
    let manager = manager_for(url);
    let handle = manager.connect_with_timeout(TIMEOUT);
    let peer = accept(&listener).await;
    assert_eq!(handle.await.unwrap(), ConnectionState::Connected);
    (manager, peer)
}

#[derive(Default)]
struct CountingHooks {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl ConnectionHooks for CountingHooks {
    fn on_connected(&self, _manager: &ConnectionManager) {
        let _ = self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        let _ = self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn single_result_round_trip() {
    let (manager, mut peer) = connect_pair().await;

    let client = manager.clone();
    let pending =
        tokio::spawn(async move { client.request("ui/init", json!({}), ReplyTimeout::Default).await });

    let frame = next_json(&mut peer).await;
    assert_eq!(
        frame,
        json!({"type": "event", "name": "ui/init", "id": "a-1", "data": {}})
    );
    send_json(&mut peer, json!({"type": "result", "id": "a-1", "data": {"ok": true}})).await;

    let reply = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(reply, Ok(json!({"ok": true})));
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn event_map_progress_then_succeed() {
    let (manager, mut peer) = connect_pair().await;
    let _ = manager
        .send("warmup", json!({}), ResponseSpec::None, ReplyTimeout::Default)
        .unwrap();
    let _ = next_json(&mut peer).await;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress_in = Arc::clone(&progress);
    let handlers = EventHandlers::new()
        .on_event("progress", move |args| progress_in.lock().extend_from_slice(args))
        .on_event("succeed", move |args| {
            if let Some(tx) = done_tx.lock().take() {
                let _ = tx.send(args.to_vec());
            }
        });

    let id = manager
        .send("job/run", json!({"n": 2}), handlers.into(), ReplyTimeout::Default)
        .unwrap();
    assert_eq!(id.as_str(), "a-2");
    assert_eq!(next_json(&mut peer).await["name"], "job/run");

    send_json(&mut peer, json!({"type": "progress", "id": "a-2", "data": [50]})).await;
    send_json(&mut peer, json!({"type": "succeed", "id": "a-2", "data": [1, 2]})).await;

    let args = timeout(TIMEOUT, done_rx).await.unwrap().unwrap();
    assert_eq!(args, vec![json!(1), json!(2)]);
    assert_eq!(*progress.lock(), vec![json!(50)]);
    assert!(!manager.registry().contains(&id));
}

#[tokio::test]
async fn watchdog_fires_when_handshake_stalls() {
    // Accepts TCP but never answers the upgrade.
    let (listener, url) = bind().await;
    let _stall = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let manager = manager_for(url);
    let hooks = Arc::new(CountingHooks::default());
    manager.add_hooks(Arc::clone(&hooks) as Arc<dyn ConnectionHooks>);

    let state = timeout(TIMEOUT, manager.connect_with_timeout(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(hooks.connected.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refused_connection_stays_disconnected() {
    let (listener, url) = bind().await;
    drop(listener);

    let manager = manager_for(url);
    let state = timeout(TIMEOUT, manager.connect()).await.unwrap().unwrap();
    assert_eq!(state, ConnectionState::Disconnected);

    let err = manager
        .send("x", json!({}), ResponseSpec::single(|_| {}), ReplyTimeout::Default)
        .unwrap_err();
    assert!(matches!(err, ClientError::Transport { .. }));
}

#[tokio::test]
async fn malformed_frame_does_not_end_session() {
    let (manager, mut peer) = connect_pair().await;

    let client = manager.clone();
    let pending =
        tokio::spawn(async move { client.request("x", json!({}), ReplyTimeout::Default).await });
    let frame = next_json(&mut peer).await;

    peer.send(Message::Text("{not json".into())).await.unwrap();
    send_json(&mut peer, json!({"type": "result", "id": frame["id"], "data": 42})).await;

    let reply = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(reply, Ok(json!(42)));
    assert_eq!(manager.protocol_error_count(), 1);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn actions_reach_listeners_in_order() {
    let (manager, mut peer) = connect_pair().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let first = tx.clone();
    manager.register_action_listener(move |name, _| {
        let _ = first.send(format!("first:{name}"));
        Ok(())
    });
    manager.register_action_listener(move |name, _| {
        let _ = tx.send(format!("second:{name}"));
        Ok(())
    });

    send_json(
        &mut peer,
        json!({"type": "action", "name": "view/add", "id": "", "data": {"id": "v1"}}),
    )
    .await;

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, vec!["first:view/add", "second:view/add"]);
}

#[tokio::test]
async fn disconnect_closes_pending_and_socket() {
    let (manager, mut peer) = connect_pair().await;
    let hooks = Arc::new(CountingHooks::default());
    manager.add_hooks(Arc::clone(&hooks) as Arc<dyn ConnectionHooks>);

    let client = manager.clone();
    let pending =
        tokio::spawn(async move { client.request("slow", json!({}), ReplyTimeout::Never).await });
    let _ = next_json(&mut peer).await;

    assert!(manager.disconnect());
    assert!(!manager.disconnect());

    let reply = timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(reply, Err(ClientError::ConnectionClosed));
    assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);

    // The peer sees the close.
    let end = timeout(TIMEOUT, async {
        loop {
            match peer.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok());
}

#[tokio::test]
async fn peer_close_fires_disconnected_hook() {
    let (manager, mut peer) = connect_pair().await;
    let hooks = Arc::new(CountingHooks::default());
    manager.add_hooks(Arc::clone(&hooks) as Arc<dyn ConnectionHooks>);
    let mut states = manager.watch_state();

    peer.close(None).await.unwrap();

    let _ = timeout(
        TIMEOUT,
        states.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnect_restarts_request_ids() {
    let (listener, url) = bind().await;
    let manager = manager_for(url);

    for _ in 0..2 {
        let handle = manager.connect_with_timeout(TIMEOUT);
        let mut peer = accept(&listener).await;
        assert_eq!(handle.await.unwrap(), ConnectionState::Connected);

        let _ = manager
            .send("ping", json!({}), ResponseSpec::None, ReplyTimeout::Default)
            .unwrap();
        assert_eq!(next_json(&mut peer).await["id"], "a-1");
        assert!(manager.disconnect());
    }
}
