//! Ordered fan-out of unsolicited action frames.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

/// A listener for action frames: `(name, data)`.
pub type ActionListener = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Holds action listeners in registration order.
///
/// Listeners are never removed; they live as long as the dispatcher.
#[derive(Default)]
pub struct ActionDispatcher {
    listeners: RwLock<Vec<ActionListener>>,
}

impl ActionDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener. Registering the same closure twice calls it twice.
    pub fn register<F>(&self, listener: F)
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Invoke every listener in order with `(name, data)`.
    ///
    /// A listener that errors or panics is logged and skipped; the rest still
    /// run. Returns how many listeners completed without failing.
    pub fn broadcast(&self, name: &str, data: &Value) -> usize {
        let listeners: Vec<ActionListener> = self.listeners.read().clone();
        debug!(name, listeners = listeners.len(), "broadcasting action");

        let mut delivered = 0;
        for (index, listener) in listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener(name, data))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(name, index, error = %e, "action listener failed"),
                Err(panic) => {
                    warn!(name, index, panic = %panic_message(panic.as_ref()), "action listener panicked");
                }
            }
        }
        delivered
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}
