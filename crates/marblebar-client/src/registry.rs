//! Request registry.
//!
//! Owns the id allocator, the map from request id to pending entry, and each
//! entry's timeout timer. All three live behind one mutex.
//!
//! An entry is removed exactly once: by its terminal reply, by its timer, or
//! by [`RequestRegistry::fail_all`] at teardown. Each entry carries a
//! sequence number that is never reused, and the timer only removes the
//! entry whose sequence it was armed for, so a late timer is a no-op even if
//! the id has been handed out again on a newer connection.
//!
//! Callbacks and handlers run after the lock is released, so they may issue
//! new requests. A panicking callback is logged and contained.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use marblebar_core::errors::{ClientError, Result};
use marblebar_core::frame::{OutboundFrame, Reply};
use marblebar_core::ids::{IdAllocator, RequestId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dispatcher::panic_message;

/// Reply window applied when a request does not override it.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Handler key invoked on timeout and teardown in event-map mode.
pub const ON_ERROR: &str = "onError";

/// Callback for single-result requests.
pub type ResultCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Handler for one named reply; receives the frame's positional arguments.
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync + 'static>;

/// Map an event name to its handler key: `progress` → `onProgress`.
///
/// The empty name maps to the empty key, which never has a handler.
pub fn handler_key(event: &str) -> String {
    let mut chars = event.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => {
            let mut key = String::with_capacity(event.len() + 2);
            key.push_str("on");
            key.extend(first.to_uppercase());
            key.push_str(chars.as_str());
            key
        }
    }
}

/// Whether a named reply ends an event-map request.
pub fn is_terminal_event(event: &str) -> bool {
    matches!(event, "succeed" | "failed")
}

/// Named handlers for an event-map request, keyed `onX`.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: HashMap<String, EventHandler>,
}

impl EventHandlers {
    /// Create an empty handler map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a raw key such as `onSucceed`.
    #[must_use]
    pub fn on<F>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let _ = self.handlers.insert(key.into(), Arc::new(handler));
        self
    }

    /// Register a handler for an event name (`progress` → `onProgress`).
    #[must_use]
    pub fn on_event<F>(self, event: &str, handler: F) -> Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let key = handler_key(event);
        self.on(key, handler)
    }

    /// Register the `onError` handler.
    #[must_use]
    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.on(ON_ERROR, handler)
    }

    /// Look up a handler by key.
    pub fn get(&self, key: &str) -> Option<&EventHandler> {
        self.handlers.get(key)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("EventHandlers").field("keys", &keys).finish()
    }
}

/// How the caller wants replies delivered.
pub enum ResponseSpec {
    /// Fire and forget: nothing is registered.
    None,
    /// One callback, completed by a `result` frame.
    Single(ResultCallback),
    /// Named handlers, completed by `succeed` or `failed`.
    Events(EventHandlers),
}

impl ResponseSpec {
    /// Wrap a single-result callback.
    pub fn single<F>(callback: F) -> Self
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        Self::Single(Box::new(callback))
    }
}

impl From<EventHandlers> for ResponseSpec {
    fn from(handlers: EventHandlers) -> Self {
        Self::Events(handlers)
    }
}

impl fmt::Debug for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Single(_) => f.write_str("Single"),
            Self::Events(h) => f.debug_tuple("Events").field(h).finish(),
        }
    }
}

/// Per-request reply window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplyTimeout {
    /// The registry's configured window.
    #[default]
    Default,
    /// No timer; the entry stays pending until a reply or teardown.
    Never,
    /// An explicit window.
    After(Duration),
}

impl ReplyTimeout {
    /// Millisecond form where `0` means [`ReplyTimeout::Never`].
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::Never
        } else {
            Self::After(Duration::from_millis(ms))
        }
    }

    fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Default => default,
            Self::Never => None,
            Self::After(d) => Some(d),
        }
    }
}

/// Outbound half of a transport as seen by the registry.
pub trait FrameSink: Send + Sync {
    /// Queue one text frame for the peer.
    fn transmit(&self, text: String) -> Result<()>;
}

/// What [`RequestRegistry::resolve`] did with a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The reply completed the request and removed its entry.
    Completed,
    /// A non-terminal named reply was delivered; the entry stays.
    Progress,
    /// A single-result request saw a non-result frame; nothing changed.
    Ignored,
    /// No pending entry for the id (never issued, or already settled).
    Unknown,
}

enum PendingMode {
    Single(ResultCallback),
    Events(Arc<EventHandlers>),
}

impl PendingMode {
    fn fail(self, id: &RequestId, err: &ClientError) {
        match self {
            Self::Single(callback) => guarded(id, || callback(Err(err.clone()))),
            Self::Events(handlers) => {
                if let Some(on_error) = handlers.get(ON_ERROR) {
                    guarded(id, || on_error(&[Value::String(err.to_string())]));
                }
            }
        }
    }
}

struct PendingRequest {
    seq: u64,
    mode: PendingMode,
    timer: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl PendingRequest {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct RegistryState {
    ids: IdAllocator,
    pending: HashMap<RequestId, PendingRequest>,
    next_seq: u64,
}

/// Pending-request bookkeeping for one connection object.
pub struct RequestRegistry {
    state: Arc<Mutex<RegistryState>>,
    default_timeout: Option<Duration>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new(Some(DEFAULT_REPLY_TIMEOUT))
    }
}

impl RequestRegistry {
    /// Create a registry. `default_timeout` of `None` disables the default window.
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            default_timeout,
        }
    }

    /// Send an event and register how its replies are delivered.
    ///
    /// With no sink nothing is allocated or registered and a transport
    /// error is returned. The entry is registered before the frame is handed
    /// to the sink; if the hand-off fails the entry is withdrawn without
    /// invoking its callback.
    ///
    /// Must be called within a Tokio runtime when a timer is armed.
    pub fn send(
        &self,
        sink: Option<&dyn FrameSink>,
        name: &str,
        data: Value,
        response: ResponseSpec,
        timeout: ReplyTimeout,
    ) -> Result<RequestId> {
        let Some(sink) = sink else {
            warn!(name, "send attempted without an active transport");
            return Err(ClientError::transport("not connected"));
        };

        let (id, seq) = {
            let mut state = self.state.lock();
            let id = state.ids.next_id();
            let seq = self.register_locked(&mut state, &id, response, timeout);
            (id, seq)
        };

        let frame = OutboundFrame::new(name, id.clone(), data);
        if let Err(e) = sink.transmit(frame.encode()) {
            warn!(%id, name, error = %e, "failed to hand frame to transport");
            if let Some(seq) = seq {
                self.withdraw(&id, seq);
            }
            return Err(e);
        }

        debug!(%id, name, "sent event");
        Ok(id)
    }

    fn register_locked(
        &self,
        state: &mut RegistryState,
        id: &RequestId,
        response: ResponseSpec,
        timeout: ReplyTimeout,
    ) -> Option<u64> {
        let mode = match response {
            ResponseSpec::None => return None,
            ResponseSpec::Single(callback) => PendingMode::Single(callback),
            ResponseSpec::Events(handlers) => PendingMode::Events(Arc::new(handlers)),
        };

        state.next_seq += 1;
        let seq = state.next_seq;
        let timer = timeout
            .resolve(self.default_timeout)
            .map(|after| arm_timer(Arc::downgrade(&self.state), id.clone(), seq, after));

        let previous = state.pending.insert(
            id.clone(),
            PendingRequest {
                seq,
                mode,
                timer,
                created_at: Instant::now(),
            },
        );
        debug_assert!(previous.is_none(), "request id reused within a connection");
        Some(seq)
    }

    fn withdraw(&self, id: &RequestId, seq: u64) {
        let mut state = self.state.lock();
        if state.pending.get(id).is_some_and(|e| e.seq == seq) {
            if let Some(mut entry) = state.pending.remove(id) {
                entry.cancel_timer();
            }
        }
    }

    /// Deliver a reply frame to the request it answers.
    pub fn resolve(&self, id: &RequestId, reply: Reply) -> Resolution {
        let mut state = self.state.lock();
        let Some(entry) = state.pending.get_mut(id) else {
            drop(state);
            debug!(%id, event = reply.event(), "reply for unknown or settled request");
            return Resolution::Unknown;
        };

        let handlers = match &entry.mode {
            PendingMode::Single(_) => None,
            PendingMode::Events(handlers) => Some(Arc::clone(handlers)),
        };

        let Some(handlers) = handlers else {
            let data = match reply {
                Reply::Result { data } => data,
                other => {
                    drop(state);
                    debug!(%id, event = other.event(), "non-result reply ignored for single-result request");
                    return Resolution::Ignored;
                }
            };
            let Some(mut entry) = state.pending.remove(id) else {
                return Resolution::Unknown;
            };
            drop(state);
            entry.cancel_timer();
            debug!(%id, elapsed_ms = elapsed_ms(entry.created_at), "request completed");
            if let PendingMode::Single(callback) = entry.mode {
                guarded(id, || callback(Ok(data)));
            }
            return Resolution::Completed;
        };

        entry.cancel_timer();
        let (event, args) = reply.into_parts();
        let terminal = is_terminal_event(&event);
        if terminal {
            if let Some(entry) = state.pending.remove(id) {
                debug!(%id, event = %event, elapsed_ms = elapsed_ms(entry.created_at), "request completed");
            }
        } else {
            // Re-key the entry so a timer already past its sleep misses it.
            state.next_seq += 1;
            let fresh = state.next_seq;
            if let Some(entry) = state.pending.get_mut(id) {
                entry.seq = fresh;
            }
        }
        drop(state);

        let key = handler_key(&event);
        match handlers.get(&key).filter(|_| !key.is_empty()) {
            Some(handler) => guarded(id, || handler(&args)),
            None => debug!(%id, event = %event, "no handler for reply"),
        }

        if terminal {
            Resolution::Completed
        } else {
            Resolution::Progress
        }
    }

    /// Settle every pending request with `err`, cancelling its timer.
    ///
    /// Callers are notified in issue order. Returns how many were settled.
    pub fn fail_all(&self, err: &ClientError) -> usize {
        let drained = Leftovers(self.state.lock().pending.drain().collect());
        drained.settle(err)
    }

    /// Drain every pending entry and restart ids at `a-1` in one step.
    ///
    /// The drained entries are returned unnotified so the caller can settle
    /// them once its own locks are released.
    pub fn restart(&self) -> Leftovers {
        let mut state = self.state.lock();
        state.ids.reset();
        Leftovers(state.pending.drain().collect())
    }

    /// Begin a new connection: settle leftovers and restart ids at `a-1`.
    pub fn reset(&self) {
        let leftovers = self.restart().settle(&ClientError::ConnectionClosed);
        if leftovers > 0 {
            warn!(count = leftovers, "pending requests from a previous connection closed");
        }
    }

    /// Whether a request is still pending.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.state.lock().pending.contains_key(id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Pending ids in issue order.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        let state = self.state.lock();
        let mut entries: Vec<(&RequestId, u64)> =
            state.pending.iter().map(|(id, e)| (id, e.seq)).collect();
        entries.sort_by_key(|(_, seq)| *seq);
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// The configured default reply window.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}

impl fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Entries drained by [`RequestRegistry::restart`], not yet notified.
#[must_use = "drained requests must be settled"]
pub struct Leftovers(Vec<(RequestId, PendingRequest)>);

impl Leftovers {
    /// Number of drained entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was drained.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cancel every timer and notify callers with `err` in issue order.
    pub fn settle(mut self, err: &ClientError) -> usize {
        self.0.sort_by_key(|(_, entry)| entry.seq);
        let count = self.0.len();
        for (id, mut entry) in self.0 {
            entry.cancel_timer();
            debug!(%id, error = %err, "settling pending request");
            entry.mode.fail(&id, err);
        }
        count
    }
}

impl fmt::Debug for Leftovers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leftovers").field("count", &self.len()).finish()
    }
}

fn arm_timer(
    state: Weak<Mutex<RegistryState>>,
    id: RequestId,
    seq: u64,
    after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(state) = state.upgrade() {
            expire(&state, &id, seq, after);
        }
    })
}

/// Timer path: remove the entry only if it is still the one this timer was armed for.
fn expire(state: &Mutex<RegistryState>, id: &RequestId, seq: u64, after: Duration) {
    let entry = {
        let mut guard = state.lock();
        if guard.pending.get(id).is_some_and(|e| e.seq == seq) {
            guard.pending.remove(id)
        } else {
            None
        }
    };
    let Some(entry) = entry else {
        return;
    };

    warn!(%id, timeout_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX), "request timed out");
    entry.mode.fail(
        id,
        &ClientError::Timeout {
            id: id.clone(),
            after,
        },
    );
}

fn guarded(id: &RequestId, callback: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        warn!(%id, panic = %panic_message(panic.as_ref()), "reply callback panicked");
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
