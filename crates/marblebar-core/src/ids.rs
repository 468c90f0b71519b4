//! Request identifiers.
//!
//! Ids are minted by the sender as `"a-" + counter`. The counter is owned by
//! a single [`IdAllocator`] per connection: strictly increasing, never
//! reused until the allocator is reset for a new connection.

use std::fmt;

use serde::{Deserialize, Serialize};

const PREFIX: &str = "a-";

/// Identifier correlating an outbound event frame with its reply frame(s).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Build the id for the given counter value (`a-<n>`).
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("{PREFIX}{n}"))
    }

    /// Wrap an id received from the peer verbatim.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The counter value embedded in a locally minted id.
    ///
    /// Returns `None` for ids that do not follow the `a-<n>` shape.
    pub fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix(PREFIX)?.parse().ok()
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Monotonic id source for one connection.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    /// Create an allocator whose first id is `a-1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&mut self) -> RequestId {
        self.last += 1;
        RequestId::from_sequence(self.last)
    }

    /// The most recently issued counter value (`0` before the first id).
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Start over at `a-1`. Only valid when a new connection begins.
    pub fn reset(&mut self) {
        self.last = 0;
    }
}
