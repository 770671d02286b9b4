//! Admission/exclusion gate between client operations and rebalance:
//! `spec.md` §4.6 and §9's gate-semantics design note.
//!
//! Every client command (`STORE`, `REMOVE`, `LIST`, `LOAD`/`RELOAD`) holds a
//! shared guard for the duration of its handling; a rebalance pass takes the
//! exclusive guard, which waits for every in-flight shared guard to drop
//! before it is granted and blocks new shared guards until it is released.
//! This is `tokio::sync::RwLock`'s standard semantics, so quiescing and
//! resuming client sessions falls out of the wake-on-release behavior of the
//! lock itself: no counter, flag, or busy-wait is needed, satisfying the
//! design note's "wake every session when rebalance ends" option.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Guard held by a handled client command, admitting it while observing any
/// concurrently running rebalance pass.
pub type ClientGuard<'a> = RwLockReadGuard<'a, ()>;

/// Guard held by a running rebalance pass, excluding all client commands.
pub type RebalanceGuard<'a> = RwLockWriteGuard<'a, ()>;

/// The gate itself.
#[derive(Debug, Default)]
pub struct Gate {
    lock: RwLock<()>,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self { lock: RwLock::new(()) }
    }

    /// Admits one client command. Waits if a rebalance pass currently holds
    /// the exclusive guard.
    pub async fn client_guard(&self) -> ClientGuard<'_> {
        self.lock.read().await
    }

    /// Acquires exclusive access for a rebalance pass. Waits for every
    /// in-flight client command to finish, then blocks new ones until the
    /// returned guard is dropped.
    pub async fn exclusive(&self) -> RebalanceGuard<'_> {
        self.lock.write().await
    }
}
