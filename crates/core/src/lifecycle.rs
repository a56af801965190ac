//! Authentication lifecycle of a service session.
//!
//! ```text
//! Anonymous      --LoginStarted-->   Authenticating
//! Authenticating --LoginSucceeded--> Authenticated
//! Authenticating --LoginFailed-->    AuthFailed
//! Authenticated  --ExpiryDetected--> Stale
//! Stale          --LoginStarted-->   Authenticating
//! Authenticated  --SliceUpdated-->   Authenticated
//! AuthFailed     --Retry-->          Anonymous
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Anonymous,
    Authenticating,
    Authenticated,
    Stale,
    AuthFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A login or credential regeneration began.
    LoginStarted,
    LoginSucceeded,
    LoginFailed,
    /// An expired credential was noticed on access.
    ExpiryDetected,
    /// A state slice was updated from observed traffic.
    SliceUpdated,
    /// Explicit external retry after a failed authentication.
    Retry,
}

impl Lifecycle {
    pub fn transition(self, event: LifecycleEvent) -> Result<Lifecycle> {
        use Lifecycle::*;
        use LifecycleEvent::*;

        let next = match (self, event) {
            (Anonymous | Stale | Authenticated, LoginStarted) => Authenticating,
            (Authenticating, LoginSucceeded) => Authenticated,
            (Authenticating, LoginFailed) => AuthFailed,
            (Authenticated | Stale, ExpiryDetected) => Stale,
            // Traffic keeps flowing regardless of auth state; only the
            // authenticated self-loop is meaningful.
            (state, SliceUpdated) => state,
            (AuthFailed, Retry) => Anonymous,
            (state, event) => {
                return Err(Error::Programming(format!(
                    "illegal lifecycle transition: {:?} in state {}",
                    event, state
                )))
            }
        };
        Ok(next)
    }

    /// Only `Retry` leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        self == Lifecycle::AuthFailed
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Anonymous => "ANONYMOUS",
            Lifecycle::Authenticating => "AUTHENTICATING",
            Lifecycle::Authenticated => "AUTHENTICATED",
            Lifecycle::Stale => "STALE",
            Lifecycle::AuthFailed => "AUTH_FAILED",
        };
        f.write_str(s)
    }
}
