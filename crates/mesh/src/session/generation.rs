//! Generation guard for session teardown
//!
//! Every join runs under one generation. Leaving (or dropping the session)
//! advances the epoch and cancels the generation's token, so work started
//! for the old membership stops and its late results can be recognised and
//! discarded.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct GuardInner {
    epoch: AtomicU64,
    token: Mutex<CancellationToken>,
}

/// Shared epoch counter plus the cancellation token of the live generation
#[derive(Clone)]
pub struct GenerationGuard {
    inner: Arc<GuardInner>,
}

/// A captured generation
#[derive(Debug, Clone)]
pub struct Generation {
    epoch: u64,
    token: CancellationToken,
}

impl Generation {
    /// Epoch number
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Token cancelled when this generation ends
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this generation already ended
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl GenerationGuard {
    /// Start at epoch 0
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GuardInner {
                epoch: AtomicU64::new(0),
                token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Capture the live generation
    pub fn current(&self) -> Generation {
        let token = self.inner.token.lock();
        Generation {
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            token: token.clone(),
        }
    }

    /// Whether `generation` is still the live one
    pub fn is_current(&self, generation: &Generation) -> bool {
        !generation.is_cancelled() && self.inner.epoch.load(Ordering::SeqCst) == generation.epoch
    }

    /// End the live generation and start the next one
    ///
    /// Returns the new epoch.
    pub fn advance(&self) -> u64 {
        let mut token = self.inner.token.lock();
        token.cancel();
        *token = CancellationToken::new();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Session generation advanced to {}", epoch);
        epoch
    }

    /// Handle that can end the live generation from another task
    pub fn teardown_handle(&self) -> TeardownHandle {
        TeardownHandle {
            guard: self.clone(),
        }
    }
}

impl Default for GenerationGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels whatever the session is doing right now
///
/// The session notices at its next await point and tears down.
#[derive(Clone)]
pub struct TeardownHandle {
    guard: GenerationGuard,
}

impl TeardownHandle {
    /// Cancel the live generation
    pub fn cancel(&self) {
        self.guard.advance();
    }
}
