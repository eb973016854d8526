//! Credential seam for connect-time authentication
//!
//! Token issuance lives outside this crate; the channel only needs a bearer
//! string per connect attempt.

use std::sync::Arc;

use tether_utils::Result;

/// Supplies a bearer credential for one connect attempt.
///
/// Called once per attempt, including each reconnect attempt, so rotated
/// tokens are picked up automatically. A failure here puts the channel into
/// `Failed` without entering the backoff loop.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String>;
}

/// Fixed-token provider for backends with long-lived credentials
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    fn token(&self) -> Result<String> {
        (**self).token()
    }
}
