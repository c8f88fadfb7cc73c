//! Lock requests and lock-state replies

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock a transaction asks for when reading or writing a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    NoLock,
    ReadLock,
    WriteLock,
}

/// Lock state reported back to a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    /// Row does not exist (or is being inserted by someone else)
    NotFound,
    /// Row read without a lock; from a unique index, the key is already committed
    NoLock,
    ReadLock,
    WriteLock,
    /// Request queued behind the current holder
    Pending,
    /// Index key staged and locked for the requester
    IndexLock,
    /// Index key queued, or already held by the requester
    IndexPending,
    PendingToWriteLock,
    PendingToReadLock,
    /// Row went away while the request was queued
    PendingToNoLock,
    PendingToIndexLock,
    /// Key was committed by the previous holder while queued
    PendingToIndexNoLock,
}

impl LockState {
    /// Row lock state for a freshly granted lock of the given type
    pub fn granted(lock: LockType) -> Self {
        match lock {
            LockType::NoLock => LockState::NoLock,
            LockType::ReadLock => LockState::ReadLock,
            LockType::WriteLock => LockState::WriteLock,
        }
    }

    /// Transition state sent when a queued request is finally granted
    pub fn pending_granted(lock: LockType) -> Self {
        match lock {
            LockType::NoLock => LockState::PendingToNoLock,
            LockType::ReadLock => LockState::PendingToReadLock,
            LockType::WriteLock => LockState::PendingToWriteLock,
        }
    }

    /// Whether the requester now holds a lock because of this reply
    pub fn holds_lock(self) -> bool {
        matches!(
            self,
            LockState::ReadLock
                | LockState::WriteLock
                | LockState::IndexLock
                | LockState::PendingToReadLock
                | LockState::PendingToWriteLock
                | LockState::PendingToIndexLock
        )
    }

    /// Whether this reply resolves an earlier `Pending`/`IndexPending`
    pub fn is_transition(self) -> bool {
        matches!(
            self,
            LockState::PendingToWriteLock
                | LockState::PendingToReadLock
                | LockState::PendingToNoLock
                | LockState::PendingToIndexLock
                | LockState::PendingToIndexNoLock
        )
    }

    /// Lock type held after this reply, if any
    pub fn lock_type(self) -> Option<LockType> {
        match self {
            LockState::ReadLock | LockState::PendingToReadLock => Some(LockType::ReadLock),
            LockState::WriteLock | LockState::PendingToWriteLock => Some(LockType::WriteLock),
            LockState::NoLock => Some(LockType::NoLock),
            _ => None,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockState::NotFound => "NOTFOUNDLOCK",
            LockState::NoLock => "NOLOCK",
            LockState::ReadLock => "READLOCK",
            LockState::WriteLock => "WRITELOCK",
            LockState::Pending => "PENDINGLOCK",
            LockState::IndexLock => "INDEXLOCK",
            LockState::IndexPending => "INDEXPENDINGLOCK",
            LockState::PendingToWriteLock => "PENDINGTOWRITELOCK",
            LockState::PendingToReadLock => "PENDINGTOREADLOCK",
            LockState::PendingToNoLock => "PENDINGTONOLOCK",
            LockState::PendingToIndexLock => "PENDINGTOINDEXLOCK",
            LockState::PendingToIndexNoLock => "PENDINGTOINDEXNOLOCK",
        };
        f.write_str(name)
    }
}
