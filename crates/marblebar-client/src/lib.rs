//! # marblebar-client
//!
//! The message-correlation core of the MarbleBar browser client: one
//! persistent WebSocket carrying JSON frames, multiplexed into
//! request/reply exchanges and unsolicited action notifications.
//!
//! - [`registry`]: id allocation, pending replies, per-request timeouts
//! - [`dispatcher`]: ordered fan-out of action frames to listeners
//! - [`transport`]: the socket seam and its `tokio-tungstenite` implementation
//! - [`connection`]: connect watchdog, teardown, inbound routing
//! - [`hooks`]: "connected" / "disconnected" notifications for the UI layer

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod hooks;
pub mod registry;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::ActionDispatcher;
pub use hooks::ConnectionHooks;
pub use registry::{
    EventHandlers, FrameSink, Leftovers, ReplyTimeout, RequestRegistry, Resolution, ResponseSpec,
};
pub use transport::{Connector, TransportEvent, TransportLink, WsConnector};
