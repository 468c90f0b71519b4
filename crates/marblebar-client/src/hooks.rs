//! Connection lifecycle hooks for the layer above the client core.

use crate::connection::ConnectionManager;

/// Notified when a connection is established or lost.
///
/// Hooks are invoked outside every internal lock, so they may send
/// requests or call back into the manager.
pub trait ConnectionHooks: Send + Sync {
    /// The transport opened and the manager is `Connected`.
    fn on_connected(&self, _manager: &ConnectionManager) {}

    /// An established connection was torn down.
    ///
    /// Not called when a connect attempt is abandoned before it opened.
    fn on_disconnected(&self) {}
}
