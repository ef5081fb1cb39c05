//! Operation locks.
//!
//! Named locks that decide whether an operation class may run right now.
//! A lock is either held exclusively by one holder or shared by any number
//! of holders of the same class. Locks live for the lifetime of the process
//! and are never persisted; after a restart everything is free and the
//! supervisors re-derive what must run from persisted state.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Operation class shared by app task workers and taken exclusively by
/// platform-wide maintenance (backup, update, certificate renewal).
pub const PLATFORM_LOCK: &str = "platform";

const RELEASE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("locked for {name} ({mode:?}, {holders} holders)")]
    AlreadyLocked {
        name: String,
        mode: LockMode,
        holders: u32,
    },
}

#[derive(Debug)]
struct LockState {
    mode: LockMode,
    holders: u32,
}

/// Process-wide lock table.
///
/// Every release that frees a lock is broadcast to all subscribers with the
/// lock name. Subscribers must re-check their own precondition; the name is
/// informational only.
pub struct LockRegistry {
    locks: Mutex<HashMap<String, LockState>>,
    released_tx: broadcast::Sender<String>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        let (released_tx, _) = broadcast::channel(RELEASE_CHANNEL_CAPACITY);
        Self {
            locks: Mutex::new(HashMap::new()),
            released_tx,
        }
    }

    /// Take `name` exclusively. Fails if anyone holds it.
    pub fn acquire_exclusive(&self, name: &str) -> Result<(), LockError> {
        let mut locks = self.table();
        if let Some(state) = locks.get(name).filter(|s| s.holders > 0) {
            return Err(LockError::AlreadyLocked {
                name: name.to_string(),
                mode: state.mode,
                holders: state.holders,
            });
        }

        locks.insert(
            name.to_string(),
            LockState {
                mode: LockMode::Exclusive,
                holders: 1,
            },
        );
        debug!(lock = %name, "Acquired exclusive lock");
        Ok(())
    }

    /// Take `name` shared. Fails only while it is held exclusively.
    pub fn acquire_shared(&self, name: &str) -> Result<(), LockError> {
        let mut locks = self.table();
        let state = locks.entry(name.to_string()).or_insert(LockState {
            mode: LockMode::Shared,
            holders: 0,
        });

        if state.holders > 0 && state.mode == LockMode::Exclusive {
            return Err(LockError::AlreadyLocked {
                name: name.to_string(),
                mode: state.mode,
                holders: state.holders,
            });
        }

        state.mode = LockMode::Shared;
        state.holders += 1;
        debug!(lock = %name, holders = state.holders, "Acquired shared lock");
        Ok(())
    }

    /// Drop one holder of `name`. Broadcasts once the lock is free.
    pub fn release(&self, name: &str) {
        let freed = {
            let mut locks = self.table();
            match locks.get_mut(name) {
                Some(state) if state.holders > 0 => {
                    state.holders -= 1;
                    debug!(lock = %name, holders = state.holders, "Released lock");
                    state.holders == 0
                }
                _ => {
                    debug!(lock = %name, "Release of a lock that is not held");
                    false
                }
            }
        };

        if freed {
            // No receivers is fine
            let _ = self.released_tx.send(name.to_string());
        }
    }

    /// Notifications of freed locks.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.released_tx.subscribe()
    }

    pub fn holders(&self, name: &str) -> u32 {
        self.table().get(name).map(|s| s.holders).unwrap_or(0)
    }

    /// Mode of a currently held lock.
    pub fn mode(&self, name: &str) -> Option<LockMode> {
        self.table()
            .get(name)
            .filter(|s| s.holders > 0)
            .map(|s| s.mode)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockState>> {
        // The table holds plain counters, a poisoned guard is still consistent
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
