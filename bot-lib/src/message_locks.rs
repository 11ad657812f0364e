//! Serializes all fireboard work on a single source message.
//!
//! Reaction events for the same message arrive concurrently from the gateway.
//! Everything that reads a mirror entry and then writes it must do so while
//! holding the message's lock. Locks for different messages are independent.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use poise::serenity_prelude::MessageId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Mutex<AHashMap<MessageId, Arc<AsyncMutex<()>>>>;

#[derive(Debug, Default, Clone)]
pub struct MessageLocks {
    locks: Arc<LockMap>,
}

impl MessageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks the calling task (never the runtime) until no other task holds
    /// the lock for `message_id`.
    ///
    /// A guard that had to wait reports `contended()`, which callers use as
    /// the signal that any locally tracked reaction count may be stale.
    pub async fn acquire(&self, message_id: MessageId) -> MessageLockGuard {
        let lock = self
            .locks
            .lock()
            .entry(message_id)
            .or_default()
            .clone();

        let (held, contended) = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => (lock.lock_owned().await, true),
        };

        MessageLockGuard {
            locks: Arc::clone(&self.locks),
            message_id,
            contended,
            _held: held,
        }
    }
}

pub struct MessageLockGuard {
    locks: Arc<LockMap>,
    message_id: MessageId,
    contended: bool,
    _held: OwnedMutexGuard<()>,
}

impl MessageLockGuard {
    /// Whether this guard had to wait behind another holder.
    pub fn contended(&self) -> bool {
        self.contended
    }
}

impl Drop for MessageLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();

        // While this guard is alive there are exactly two references to an
        // otherwise idle lock: the map's and the owned guard's. Any more and
        // another task is waiting on it, so it must stay in the map.
        if locks
            .get(&self.message_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(&self.message_id);
        }
    }
}
