//! Processing lock
//!
//! While held, the execution driver does not start the next queued command.
//! It never interrupts a command that is already running.

use std::future::Future;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::CommandError;

#[derive(Debug)]
pub struct ProcessingLock {
    holders: Mutex<()>,
    locked: watch::Sender<bool>,
}

impl Default for ProcessingLock {
    fn default() -> Self {
        Self::new()
    }
}

struct Held<'a> {
    locked: &'a watch::Sender<bool>,
    _permit: MutexGuard<'a, ()>,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.locked.send_replace(false);
    }
}

impl ProcessingLock {
    /// Unlocked
    pub fn new() -> Self {
        let (locked, _) = watch::channel(false);
        Self {
            holders: Mutex::new(()),
            locked,
        }
    }

    /// Whether a [`ProcessingLock::with_lock`] section is in progress
    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    /// Take the lock for a short section without flagging it as held.
    /// `None` while anyone else holds it; [`ProcessingLock::with_lock`]
    /// waits until the returned guard is dropped.
    pub fn try_hold(&self) -> Option<MutexGuard<'_, ()>> {
        self.holders.try_lock().ok()
    }

    /// Hold the lock while `fut` runs; released even if `fut` is dropped
    pub async fn with_lock<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let permit = self.holders.lock().await;
        self.locked.send_replace(true);
        let _held = Held {
            locked: &self.locked,
            _permit: permit,
        };
        fut.await
    }

    /// Resolve once nobody holds the lock
    pub async fn wait_until_unlocked(&self, token: &CancellationToken) -> Result<(), CommandError> {
        let mut rx = self.locked.subscribe();
        tokio::select! {
            result = rx.wait_for(|locked| !*locked) => {
                result.map(|_| ()).map_err(|_| CommandError::Cancelled)
            }
            _ = token.cancelled() => Err(CommandError::Cancelled),
        }
    }
}
