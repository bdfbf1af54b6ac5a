//! Correlation tokens and connection handles.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Token matching a transfer request with its response and file connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(pub u32);

impl Display for RequestToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a connection owned by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle of a scheduled one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Incrementing token source shared by both transfer directions.
///
/// Tokens wrap from `u32::MAX` back to 1; zero is never handed out.
#[derive(Debug, Clone)]
pub struct TokenAllocator {
    last: u32,
}

impl TokenAllocator {
    /// Allocator whose first token is `last + 1`.
    #[must_use]
    pub(crate) const fn starting_after(last: u32) -> Self {
        Self { last }
    }

    /// Next token for which `in_use` returns `false`.
    pub fn allocate(&mut self, in_use: impl Fn(RequestToken) -> bool) -> RequestToken {
        loop {
            self.last = next_token(self.last);
            let token = RequestToken(self.last);
            if !in_use(token) {
                return token;
            }
        }
    }
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::starting_after(0)
    }
}

const fn next_token(token: u32) -> u32 {
    if token == u32::MAX { 1 } else { token + 1 }
}
