//! # marblebar-core
//!
//! Shared building blocks for the MarbleBar client:
//!
//! - [`frame`]: stateless codec between wire text and typed frames
//! - [`ids`]: `"a-<n>"` request identifiers and their per-connection allocator
//! - [`errors`]: the client error taxonomy

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod ids;

pub use errors::{ClientError, ProtocolError, Result};
pub use frame::{InboundFrame, OutboundFrame, Reply};
pub use ids::{IdAllocator, RequestId};
