//! Connection lifecycle and inbound routing.
//!
//! [`ConnectionManager`] owns the socket: it runs the connect watchdog,
//! tears the link down, and routes every inbound text frame either to the
//! [`RequestRegistry`] (frames with an id) or the [`ActionDispatcher`]
//! (action frames).
//!
//! A connect attempt has exactly one outcome. The open path, the watchdog
//! and [`ConnectionManager::disconnect`] race to settle a shared guard and
//! only the first one acts. Each established link gets an epoch so that a
//! close event from a superseded link never tears down its successor.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use marblebar_core::errors::{ClientError, ProtocolError, Result};
use marblebar_core::frame::{self, InboundFrame};
use marblebar_core::ids::RequestId;
use marblebar_settings::ClientSettings;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::ActionDispatcher;
use crate::hooks::ConnectionHooks;
use crate::registry::{FrameSink, ReplyTimeout, RequestRegistry, ResponseSpec};
use crate::transport::{Connector, LinkSender, TransportEvent, TransportLink, WsConnector};

/// Lifecycle state of the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no attempt in flight.
    #[default]
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// A link is open.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

// ── Connect attempt guard ───────────────────────────────────────────────────

const PENDING: u8 = 0;
const OPENED: u8 = 1;
const TIMED_OUT: u8 = 2;
const FAILED: u8 = 3;
const ABANDONED: u8 = 4;

/// First outcome wins.
#[derive(Debug)]
struct AttemptGuard {
    outcome: AtomicU8,
}

impl AttemptGuard {
    fn new() -> Self {
        Self {
            outcome: AtomicU8::new(PENDING),
        }
    }

    fn settle(&self, outcome: u8) -> bool {
        self.outcome
            .compare_exchange(PENDING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

struct ActiveLink {
    sender: LinkSender,
    shutdown: CancellationToken,
}

struct LinkState {
    status: ConnectionState,
    link: Option<ActiveLink>,
    attempt: Option<Arc<AttemptGuard>>,
    epoch: u64,
}

struct Inner {
    settings: ClientSettings,
    connector: Arc<dyn Connector>,
    state: Mutex<LinkState>,
    state_tx: watch::Sender<ConnectionState>,
    registry: RequestRegistry,
    dispatcher: ActionDispatcher,
    hooks: RwLock<Vec<Arc<dyn ConnectionHooks>>>,
    protocol_errors: AtomicU64,
}

/// Handle to one logical connection. Clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manager that connects over WebSocket.
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_connector(settings, Arc::new(WsConnector))
    }

    /// Manager that opens links through `connector`.
    pub fn with_connector(settings: ClientSettings, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let registry = RequestRegistry::new(settings.reply_timeout());
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                state: Mutex::new(LinkState {
                    status: ConnectionState::Disconnected,
                    link: None,
                    attempt: None,
                    epoch: 0,
                }),
                state_tx,
                registry,
                dispatcher: ActionDispatcher::new(),
                hooks: RwLock::new(Vec::new()),
                protocol_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.inner.settings.endpoint
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().status
    }

    /// Whether a link is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Attach lifecycle hooks. Hooks stay attached across reconnects.
    pub fn add_hooks(&self, hooks: Arc<dyn ConnectionHooks>) {
        self.inner.hooks.write().push(hooks);
    }

    /// Append an action listener. Listeners stay registered across reconnects.
    pub fn register_action_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(listener);
    }

    /// Pending-request bookkeeping.
    pub fn registry(&self) -> &RequestRegistry {
        &self.inner.registry
    }

    /// Number of inbound frames dropped as malformed or unroutable.
    pub fn protocol_error_count(&self) -> u64 {
        self.inner.protocol_errors.load(Ordering::Relaxed)
    }

    // ── connect ─────────────────────────────────────────────────────────

    /// Connect with the configured watchdog.
    pub fn connect(&self) -> JoinHandle<ConnectionState> {
        self.connect_with_timeout(self.inner.settings.connect_timeout())
    }

    /// Open a link, giving up after `timeout`.
    ///
    /// An open connection is torn down first; an attempt in flight is
    /// superseded. The returned handle resolves to the state once the
    /// attempt has settled.
    pub fn connect_with_timeout(&self, timeout: Duration) -> JoinHandle<ConnectionState> {
        let attempt = Arc::new(AttemptGuard::new());
        let previous = {
            let mut state = self.inner.state.lock();
            if let Some(prev) = state.attempt.take() {
                let _ = prev.settle(ABANDONED);
                debug!("superseding connect attempt");
            }
            let previous = if state.status == ConnectionState::Connected {
                state.link.take()
            } else {
                None
            };
            state.status = ConnectionState::Connecting;
            state.attempt = Some(Arc::clone(&attempt));
            self.publish(ConnectionState::Connecting);
            previous
        };

        if let Some(link) = previous {
            info!(endpoint = self.endpoint(), "reconnecting, closing current link");
            self.finish_teardown(link);
        }

        info!(endpoint = self.endpoint(), timeout_ms = millis(timeout), "connecting");
        let manager = self.clone();
        tokio::spawn(async move {
            let connector = Arc::clone(&manager.inner.connector);
            let endpoint = manager.inner.settings.endpoint.clone();
            let mut open = tokio::spawn(async move { connector.open(&endpoint).await });

            tokio::select! {
                joined = &mut open => {
                    manager.settle_open(&attempt, flatten_open(joined));
                }
                () = tokio::time::sleep(timeout) => {
                    if attempt.settle(TIMED_OUT) {
                        warn!(endpoint = manager.endpoint(), timeout_ms = millis(timeout), "connect timed out");
                        manager.drop_attempt(&attempt);
                    }
                    let late = manager.clone();
                    drop(tokio::spawn(async move {
                        late.settle_open(&attempt, flatten_open(open.await));
                    }));
                }
            }
            manager.state()
        })
    }

    fn settle_open(&self, attempt: &Arc<AttemptGuard>, opened: Result<TransportLink>) {
        match opened {
            Ok(link) => {
                if attempt.settle(OPENED) {
                    self.install(attempt, link);
                } else {
                    debug!("discarding link from a settled connect attempt");
                    link.close();
                }
            }
            Err(e) => {
                if attempt.settle(FAILED) {
                    warn!(endpoint = self.endpoint(), error = %e, "connect failed");
                    self.drop_attempt(attempt);
                } else {
                    debug!(error = %e, "late connect failure ignored");
                }
            }
        }
    }

    /// Return to `Disconnected` if `attempt` is still the current one.
    fn drop_attempt(&self, attempt: &Arc<AttemptGuard>) {
        let mut state = self.inner.state.lock();
        if state.attempt.as_ref().is_some_and(|a| Arc::ptr_eq(a, attempt)) {
            state.attempt = None;
            state.status = ConnectionState::Disconnected;
            self.publish(ConnectionState::Disconnected);
        }
    }

    fn install(&self, attempt: &Arc<AttemptGuard>, link: TransportLink) {
        let (sender, events, shutdown) = link.into_parts();

        // The registry restarts under the same lock that claims the attempt,
        // so a withdrawn attempt never touches a newer connection's requests.
        let (epoch, leftovers) = {
            let mut state = self.inner.state.lock();
            if !state.attempt.as_ref().is_some_and(|a| Arc::ptr_eq(a, attempt)) {
                drop(state);
                debug!("connect attempt withdrawn before the link was installed");
                shutdown.cancel();
                return;
            }
            let leftovers = self.inner.registry.restart();
            state.attempt = None;
            state.epoch += 1;
            state.status = ConnectionState::Connected;
            state.link = Some(ActiveLink {
                sender,
                shutdown: shutdown.clone(),
            });
            self.publish(ConnectionState::Connected);
            (state.epoch, leftovers)
        };

        let closed = leftovers.settle(&ClientError::ConnectionClosed);
        if closed > 0 {
            warn!(count = closed, "pending requests from a previous connection closed");
        }

        info!(endpoint = self.endpoint(), epoch, "connected");
        drop(tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            events,
            shutdown,
            epoch,
        )));

        for hooks in self.hooks_snapshot() {
            hooks.on_connected(self);
        }
    }

    // ── disconnect ──────────────────────────────────────────────────────

    /// Tear down the connection.
    ///
    /// Idempotent: returns `false` when already disconnected. An attempt in
    /// flight is abandoned without firing `on_disconnected`. An open link is
    /// closed, every pending request is settled with
    /// [`ClientError::ConnectionClosed`], and `on_disconnected` fires.
    pub fn disconnect(&self) -> bool {
        let link = {
            let mut state = self.inner.state.lock();
            match state.status {
                ConnectionState::Disconnected => return false,
                ConnectionState::Connecting => {
                    if let Some(attempt) = state.attempt.take() {
                        let _ = attempt.settle(ABANDONED);
                    }
                    state.status = ConnectionState::Disconnected;
                    self.publish(ConnectionState::Disconnected);
                    None
                }
                ConnectionState::Connected => {
                    state.status = ConnectionState::Disconnected;
                    self.publish(ConnectionState::Disconnected);
                    state.link.take()
                }
            }
        };

        match link {
            Some(link) => {
                info!(endpoint = self.endpoint(), "disconnecting");
                self.finish_teardown(link);
            }
            None => info!(endpoint = self.endpoint(), "connect attempt abandoned"),
        }
        true
    }

    /// Reader path: the link of `epoch` closed or failed.
    fn link_lost(&self, epoch: u64, reason: &str) {
        let link = {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch || state.status != ConnectionState::Connected {
                debug!(epoch, reason, "ignoring loss of a superseded link");
                return;
            }
            state.status = ConnectionState::Disconnected;
            self.publish(ConnectionState::Disconnected);
            state.link.take()
        };

        if let Some(link) = link {
            info!(endpoint = self.endpoint(), reason, "connection lost");
            self.finish_teardown(link);
        }
    }

    fn finish_teardown(&self, link: ActiveLink) {
        link.shutdown.cancel();
        drop(link.sender);
        let closed = self.inner.registry.fail_all(&ClientError::ConnectionClosed);
        if closed > 0 {
            info!(count = closed, "pending requests closed");
        }
        for hooks in self.hooks_snapshot() {
            hooks.on_disconnected();
        }
    }

    // ── traffic ─────────────────────────────────────────────────────────

    /// Send an event, registering `response` for its replies.
    ///
    /// Fails with [`ClientError::Transport`] when no link is open; nothing
    /// is registered in that case.
    pub fn send(
        &self,
        name: &str,
        data: Value,
        response: ResponseSpec,
        timeout: ReplyTimeout,
    ) -> Result<RequestId> {
        let sender = self
            .inner
            .state
            .lock()
            .link
            .as_ref()
            .map(|link| link.sender.clone());
        self.inner.registry.send(
            sender.as_ref().map(|s| s as &dyn FrameSink),
            name,
            data,
            response,
            timeout,
        )
    }

    /// Send an event and wait for its `result` reply.
    pub async fn request(&self, name: &str, data: Value, timeout: ReplyTimeout) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = self.send(
            name,
            data,
            ResponseSpec::single(move |outcome| {
                let _ = tx.send(outcome);
            }),
            timeout,
        )?;
        debug!(%id, name, "awaiting reply");
        rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Route one inbound text frame.
    ///
    /// Malformed and unroutable frames are logged, counted and returned as
    /// errors; the connection stays up.
    pub fn handle_inbound_text(&self, raw: &str) -> std::result::Result<(), ProtocolError> {
        match frame::decode(raw) {
            Ok(InboundFrame::Reply { id, reply }) => {
                let event = reply.event().to_owned();
                let resolution = self.inner.registry.resolve(&id, reply);
                debug!(%id, event = %event, ?resolution, "routed reply");
                Ok(())
            }
            Ok(InboundFrame::Action { name, data }) => {
                let _ = self.inner.dispatcher.broadcast(&name, &data);
                Ok(())
            }
            Err(e) => {
                let _ = self.inner.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = raw.len(), "dropping inbound frame");
                Err(e)
            }
        }
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn ConnectionHooks>> {
        self.inner.hooks.read().clone()
    }

    fn publish(&self, status: ConnectionState) {
        let _ = self.inner.state_tx.send_replace(status);
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .field("pending", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
    epoch: u64,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(inner) = inner.upgrade() else { break };
        let manager = ConnectionManager { inner };

        match event {
            Some(TransportEvent::Text(text)) => {
                let _ = manager.handle_inbound_text(&text);
            }
            Some(TransportEvent::Closed) | None => {
                manager.link_lost(epoch, "closed by peer");
                break;
            }
            Some(TransportEvent::Error(reason)) => {
                warn!(epoch, error = %reason, "transport error");
                manager.link_lost(epoch, &reason);
                break;
            }
        }
    }
    debug!(epoch, "reader stopped");
}

fn flatten_open(
    joined: std::result::Result<Result<TransportLink>, tokio::task::JoinError>,
) -> Result<TransportLink> {
    joined.map_err(|e| ClientError::transport(format!("connect task failed: {e}")))?
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::registry::EventHandlers;
    use crate::transport::{MemoryPeer, memory_link};

    /// Hands each opened link's far end to the test.
    struct MemoryConnector {
        peers: mpsc::UnboundedSender<MemoryPeer>,
        delay: Duration,
        refuse: bool,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn open(&self, _endpoint: &str) -> Result<TransportLink> {
            tokio::time::sleep(self.delay).await;
            if self.refuse {
                return Err(ClientError::transport("connection refused"));
            }
            let (link, peer) = memory_link();
            let _ = self.peers.send(peer);
            Ok(link)
        }
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

    struct Fixture {
        manager: ConnectionManager,
        hooks: Arc<CountingHooks>,
        peers: mpsc::UnboundedReceiver<MemoryPeer>,
    }

    fn fixture(delay: Duration, refuse: bool) -> Fixture {
        let (tx, peers) = mpsc::unbounded_channel();
        let connector = Arc::new(MemoryConnector {
            peers: tx,
            delay,
            refuse,
        });
        let manager = ConnectionManager::with_connector(ClientSettings::default(), connector);
        let hooks = Arc::new(CountingHooks::default());
        manager.add_hooks(Arc::clone(&hooks) as Arc<dyn ConnectionHooks>);
        Fixture {
            manager,
            hooks,
            peers,
        }
    }

    async fn connected() -> (Fixture, MemoryPeer) {
        let mut fx = fixture(Duration::ZERO, false);
        let state = fx.manager.connect().await.unwrap();
        assert_eq!(state, ConnectionState::Connected);
        let peer = fx.peers.recv().await.unwrap();
        (fx, peer)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn sent(peer: &mut MemoryPeer) -> Value {
        serde_json::from_str(&peer.try_recv().unwrap()).unwrap()
    }

    // ── connect ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn connect_opens_and_fires_hook() {
        let (fx, _peer) = connected().await;
        assert!(fx.manager.is_connected());
        assert_eq!(fx.hooks.connected.load(Ordering::SeqCst), 1);
        assert_eq!(*fx.manager.watch_state().borrow(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_wins_over_slow_open() {
        let mut fx = fixture(Duration::from_millis(1_000), false);

        let state = fx
            .manager
            .connect_with_timeout(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Disconnected);

        // The late open is closed and never reported.
        let peer = fx.peers.recv().await.unwrap();
        settle().await;
        assert!(peer.is_shut_down());
        assert_eq!(fx.manager.state(), ConnectionState::Disconnected);
        assert_eq!(fx.hooks.connected.load(Ordering::SeqCst), 0);
        assert_eq!(fx.hooks.disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_open_returns_to_disconnected() {
        let fx = fixture(Duration::from_millis(10), true);
        let state = fx.manager.connect().await.unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(fx.hooks.connected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_abandons_attempt() {
        let mut fx = fixture(Duration::from_millis(100), false);
        let handle = fx.manager.connect();
        settle().await;
        assert_eq!(fx.manager.state(), ConnectionState::Connecting);

        assert!(fx.manager.disconnect());
        assert_eq!(handle.await.unwrap(), ConnectionState::Disconnected);

        let peer = fx.peers.recv().await.unwrap();
        settle().await;
        assert!(peer.is_shut_down());
        assert_eq!(fx.hooks.connected.load(Ordering::SeqCst), 0);
        assert_eq!(fx.hooks.disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_tears_down_and_restarts_ids() {
        let (mut fx, mut first) = connected().await;
        let id = fx
            .manager
            .send("a", json!({}), ResponseSpec::None, ReplyTimeout::Default)
            .unwrap();
        assert_eq!(id.as_str(), "a-1");
        let _ = fx
            .manager
            .send("b", json!({}), ResponseSpec::None, ReplyTimeout::Default)
            .unwrap();

        assert_eq!(fx.manager.connect().await.unwrap(), ConnectionState::Connected);
        let mut second = fx.peers.recv().await.unwrap();

        assert!(first.is_shut_down());
        assert_eq!(fx.hooks.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(fx.hooks.connected.load(Ordering::SeqCst), 2);

        let id = fx
            .manager
            .send("c", json!({}), ResponseSpec::None, ReplyTimeout::Default)
            .unwrap();
        assert_eq!(id.as_str(), "a-1");
        assert_eq!(sent(&mut second)["name"], "c");
        assert_eq!(sent(&mut first)["name"], "a");
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawn_attempt_leaves_live_registry_alone() {
        let (fx, mut peer) = connected().await;
        let first = fx
            .manager
            .send("a", json!({}), ResponseSpec::single(|_| {}), ReplyTimeout::Never)
            .unwrap();
        assert_eq!(first.as_str(), "a-1");

        // An attempt that won its own race but was superseded before installing.
        let stale = Arc::new(AttemptGuard::new());
        assert!(stale.settle(OPENED));
        let (link, stale_peer) = memory_link();
        fx.manager.install(&stale, link);

        assert!(stale_peer.is_shut_down());
        assert!(fx.manager.registry().contains(&first));
        let next = fx
            .manager
            .send("b", json!({}), ResponseSpec::None, ReplyTimeout::Default)
            .unwrap();
        assert_eq!(next.as_str(), "a-2");
        assert_eq!(sent(&mut peer)["id"], "a-1");
        assert_eq!(sent(&mut peer)["id"], "a-2");
        assert_eq!(fx.hooks.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_reply_callback_keeps_reader_alive() {
        let (fx, peer) = connected().await;
        let id = fx
            .manager
            .send("x", json!({}), ResponseSpec::single(|_| panic!("callback blew up")), ReplyTimeout::Never)
            .unwrap();
        assert!(peer.send_text(format!(r#"{{"type":"result","id":"{id}","data":1}}"#)));
        settle().await;
        assert!(!fx.manager.registry().contains(&id));

        let reply = fx.manager.request("y", json!({}), ReplyTimeout::Never);
        let answer = async {
            settle().await;
            assert!(peer.send_text(r#"{"type":"result","id":"a-2","data":"still reading"}"#));
        };
        let (reply, ()) = tokio::join!(reply, answer);
        assert_eq!(reply.unwrap(), json!("still reading"));
        assert!(fx.manager.is_connected());
    }

    // ── disconnect ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let (fx, peer) = connected().await;

        assert!(fx.manager.disconnect());
        assert!(!fx.manager.disconnect());

        assert!(peer.is_shut_down());
        assert_eq!(fx.manager.state(), ConnectionState::Disconnected);
        assert_eq!(fx.hooks.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_pending_requests() {
        let (fx, _peer) = connected().await;
        let outcome = Arc::new(Mutex::new(None));
        let outcome_in = Arc::clone(&outcome);
        let _ = fx
            .manager
            .send(
                "slow",
                json!({}),
                ResponseSpec::single(move |r| *outcome_in.lock() = Some(r)),
                ReplyTimeout::Never,
            )
            .unwrap();

        assert!(fx.manager.disconnect());

        assert_eq!(*outcome.lock(), Some(Err(ClientError::ConnectionClosed)));
        assert!(fx.manager.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_disconnects() {
        let (fx, peer) = connected().await;
        let mut states = fx.manager.watch_state();

        assert!(peer.close());
        let _ = states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        assert_eq!(fx.hooks.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_disconnects() {
        let (fx, peer) = connected().await;
        assert!(peer.fail("connection reset"));
        settle().await;
        assert_eq!(fx.manager.state(), ConnectionState::Disconnected);
        assert_eq!(fx.hooks.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_link_close_does_not_touch_new_connection() {
        let (mut fx, first) = connected().await;
        let _ = fx.manager.connect().await.unwrap();
        let _second = fx.peers.recv().await.unwrap();

        let _ = first.close();
        settle().await;

        assert!(fx.manager.is_connected());
        assert_eq!(fx.hooks.disconnected.load(Ordering::SeqCst), 1);
    }

    // ── traffic ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_is_transport_error() {
        let fx = fixture(Duration::ZERO, false);
        let err = fx
            .manager
            .send("x", json!({}), ResponseSpec::single(|_| {}), ReplyTimeout::Default)
            .unwrap_err();
        assert_matches!(err, ClientError::Transport { .. });
        assert!(fx.manager.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_result_resolves_request() {
        let (fx, mut peer) = connected().await;
        let manager = fx.manager.clone();
        let pending = tokio::spawn(async move {
            manager
                .request("ui/init", json!({}), ReplyTimeout::Default)
                .await
        });

        let frame: Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], "a-1");
        assert!(peer.send_text(r#"{"type":"result","id":"a-1","data":{"ok":true}}"#));

        assert_eq!(pending.await.unwrap(), Ok(json!({"ok": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out() {
        let (fx, _peer) = connected().await;
        let err = fx
            .manager
            .request("x", json!({}), ReplyTimeout::After(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Response timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn event_map_progress_then_succeed() {
        let (fx, peer) = connected().await;
        let log: Arc<Mutex<Vec<(&str, Vec<Value>)>>> = Arc::default();
        let (progress_log, succeed_log) = (Arc::clone(&log), Arc::clone(&log));
        let handlers = EventHandlers::new()
            .on_event("progress", move |args| progress_log.lock().push(("progress", args.to_vec())))
            .on_event("succeed", move |args| succeed_log.lock().push(("succeed", args.to_vec())));

        let id = fx
            .manager
            .send("job", json!({}), handlers.into(), ReplyTimeout::Default)
            .unwrap();

        let _ = peer.send_text(r#"{"type":"progress","id":"a-1","data":[50]}"#);
        let _ = peer.send_text(r#"{"type":"succeed","id":"a-1","data":[1,2]}"#);
        settle().await;

        assert_eq!(
            *log.lock(),
            vec![
                ("progress", vec![json!(50)]),
                ("succeed", vec![json!(1), json!(2)]),
            ]
        );
        assert!(!fx.manager.registry().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn action_frames_reach_listeners() {
        let (fx, peer) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        fx.manager.register_action_listener(move |name, data| {
            seen_in.lock().push((name.to_owned(), data.clone()));
            Ok(())
        });

        let _ = peer.send_text(r#"{"type":"action","name":"view/remove","id":"","data":{"id":"v1"}}"#);
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![("view/remove".to_owned(), json!({"id": "v1"}))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_counted_and_session_continues() {
        let (fx, peer) = connected().await;
        let handle = fx.manager.clone();
        let pending = tokio::spawn(async move {
            handle.request("x", json!({}), ReplyTimeout::Default).await
        });
        settle().await;

        let _ = peer.send_text("{not json");
        let _ = peer.send_text(r#"{"type":"ping"}"#);
        let _ = peer.send_text(r#"{"type":"result","id":"a-1","data":7}"#);

        assert_eq!(pending.await.unwrap(), Ok(json!(7)));
        assert_eq!(fx.manager.protocol_error_count(), 2);
        assert!(fx.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_inbound_text_reports_protocol_errors() {
        let fx = fixture(Duration::ZERO, false);
        assert_matches!(
            fx.manager.handle_inbound_text("[]"),
            Err(ProtocolError::Malformed { .. })
        );
        assert_matches!(
            fx.manager.handle_inbound_text(r#"{"type":"error","error":"Unable to parse"}"#),
            Err(ProtocolError::Remote { .. })
        );
        // A reply for an id that was never issued is routed, not an error.
        assert!(fx
            .manager
            .handle_inbound_text(r#"{"type":"result","id":"a-99","data":null}"#)
            .is_ok());
        assert_eq!(fx.manager.protocol_error_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_hook_may_send() {
        struct InitOnConnect;

        impl ConnectionHooks for InitOnConnect {
            fn on_connected(&self, manager: &ConnectionManager) {
                let _ = manager
                    .send("ui/init", json!({}), ResponseSpec::None, ReplyTimeout::Default)
                    .unwrap();
            }
        }

        let mut fx = fixture(Duration::ZERO, false);
        fx.manager.add_hooks(Arc::new(InitOnConnect));
        let _ = fx.manager.connect().await.unwrap();
        let mut peer = fx.peers.recv().await.unwrap();

        assert_eq!(
            sent(&mut peer),
            json!({"type": "event", "name": "ui/init", "id": "a-1", "data": {}})
        );
    }
}
