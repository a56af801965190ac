//! Credential vault with single-flight refresh.
//!
//! The vault owns the current [`CredentialSet`]. When any credential has
//! expired, the next `header_value()` triggers a regeneration; callers that
//! notice the same staleness while that regeneration runs await the very
//! same call instead of starting their own.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tether_core::{CredentialSet, Error, Result};
use tracing::{debug, info, warn};

/// Produces a fresh credential set, typically by logging in again.
#[async_trait]
pub trait CredentialRegenerator: Send + Sync {
    async fn regenerate(&self) -> Result<CredentialSet>;
}

/// Epoch-seconds clock, injectable for tests.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

// Shared output must be Clone; each waiter gets its own copy of the error.
type RefreshOutcome = std::result::Result<CredentialSet, Arc<Error>>;
type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

struct VaultState {
    credentials: CredentialSet,
    in_flight: Option<InFlight>,
}

struct Inner {
    state: Mutex<VaultState>,
    regenerator: Arc<dyn CredentialRegenerator>,
    clock: Clock,
    regenerations: AtomicU64,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct CredentialVault {
    inner: Arc<Inner>,
}

impl CredentialVault {
    pub fn new(credentials: CredentialSet, regenerator: Arc<dyn CredentialRegenerator>) -> Self {
        Self::with_clock(credentials, regenerator, system_clock())
    }

    pub fn with_clock(
        credentials: CredentialSet,
        regenerator: Arc<dyn CredentialRegenerator>,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(VaultState {
                    credentials,
                    in_flight: None,
                }),
                regenerator,
                clock,
                regenerations: AtomicU64::new(0),
            }),
        }
    }

    /// True iff any stored credential has a real expiry strictly in the past.
    pub fn is_stale(&self) -> bool {
        let now = (self.inner.clock)();
        self.inner.lock().credentials.is_stale_at(now)
    }

    pub fn credentials(&self) -> CredentialSet {
        self.inner.lock().credentials.clone()
    }

    /// Number of regeneration calls made so far.
    pub fn regeneration_count(&self) -> u64 {
        self.inner.regenerations.load(Ordering::SeqCst)
    }

    /// Install a set obtained out of band, e.g. after an explicit login.
    pub fn replace(&self, credentials: CredentialSet) {
        let mut state = self.inner.lock();
        debug!(count = credentials.len(), "Credential set replaced");
        state.credentials = credentials;
    }

    /// `Cookie` header value, refreshing first if anything has expired.
    pub async fn header_value(&self) -> Result<String> {
        let refresh = {
            let mut state = self.inner.lock();
            let now = (self.inner.clock)();
            if state.credentials.is_empty() {
                return Err(Error::CredentialMissing(
                    "vault holds no credentials".to_string(),
                ));
            }
            if !state.credentials.is_stale_at(now) {
                return Ok(state.credentials.header_value());
            }
            match &state.in_flight {
                Some(in_flight) => {
                    debug!("Joining in-flight credential regeneration");
                    in_flight.clone()
                }
                None => {
                    let in_flight = Self::start_refresh(self.inner.clone());
                    state.in_flight = Some(in_flight.clone());
                    in_flight
                }
            }
        };

        match refresh.await {
            Ok(credentials) => Ok(credentials.header_value()),
            Err(e) => Err(reissue(&e)),
        }
    }

    /// The returned future installs the new set (or keeps the old one on
    /// failure) and clears the in-flight slot before resolving, so every
    /// waiter sees the same outcome.
    fn start_refresh(inner: Arc<Inner>) -> InFlight {
        async move {
            let attempt = inner.regenerations.fetch_add(1, Ordering::SeqCst) + 1;
            info!(attempt, "Credentials expired, regenerating");
            let result = inner.regenerator.regenerate().await;

            let mut state = inner.lock();
            state.in_flight = None;
            match result {
                Ok(credentials) => {
                    info!(count = credentials.len(), "Credentials regenerated");
                    state.credentials = credentials.clone();
                    Ok(credentials)
                }
                Err(e) => {
                    warn!(error = %e, "Credential regeneration failed, keeping previous set");
                    Err(Arc::new(e))
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Rebuild a shared regeneration error for one waiter, keeping its kind.
/// Errors that wrap a foreign source cannot be copied and surface as
/// `Regeneration`.
fn reissue(e: &Error) -> Error {
    match e {
        Error::CredentialMissing(m) => Error::CredentialMissing(m.clone()),
        Error::Regeneration(m) => Error::Regeneration(m.clone()),
        Error::UninitializedState(slice) => Error::UninitializedState(slice),
        Error::Transport(m) => Error::Transport(m.clone()),
        Error::Parse(m) => Error::Parse(m.clone()),
        Error::Programming(m) => Error::Programming(m.clone()),
        Error::Config(m) => Error::Config(m.clone()),
        Error::Browser(m) => Error::Browser(m.clone()),
        Error::NotFound(m) => Error::NotFound(m.clone()),
        Error::Timeout(m) => Error::Timeout(m.clone()),
        Error::Io(_) | Error::Json(_) => Error::Regeneration(e.to_string()),
    }
}
