//! Byte-range lock manager: a per-open-file ordered lock list with overlap
//! detection and owner-aware read/write gating (`spec.md` §4.7).
//!
//! Grounded in the teacher's NLM scaffolding (`nlm/mod.rs`'s `LockRequest`/
//! `Share` shapes) for the field layout of a lock request, reworked as a
//! plain `Mutex`-guarded `Vec` per the spec's "lock lists are small, lookup
//! is linear" note rather than the teacher's (buggy, duplicated) NLM types.

use std::sync::Mutex;

/// Length sentinel denoting a whole-file lock; overlaps every range in the
/// file regardless of `offset`.
pub const WHOLE_FILE: u64 = u64::MAX;

/// Which protocol is holding a lock, for owner comparison (`spec.md` §4.7,
/// §GLOSSARY "Owner").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockProtocol {
    Smb,
    Nfs,
    Ftp,
    Unknown,
}

/// A lock owner: equal iff protocol, version, and session id all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub protocol: LockProtocol,
    pub version: u32,
    pub session_id: u64,
}

/// One byte-range lock on an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLock {
    pub offset: u64,
    pub length: u64,
    pub owner: LockOwner,
}

impl FileLock {
    pub fn whole_file(owner: LockOwner) -> Self {
        Self { offset: 0, length: WHOLE_FILE, owner }
    }

    fn is_whole_file(&self) -> bool {
        self.length == WHOLE_FILE
    }

    /// Two locks overlap iff their byte ranges intersect or either covers
    /// the whole file (`spec.md` §4.7).
    fn overlaps(&self, other: &FileLock) -> bool {
        if self.is_whole_file() || other.is_whole_file() {
            return true;
        }
        let self_end = self.offset.saturating_add(self.length);
        let other_end = other.offset.saturating_add(other.length);
        self.offset < other_end && other.offset < self_end
    }

    /// True iff this lock, held by an owner other than `actor`, overlaps
    /// `(offset, length)`.
    fn covers(&self, offset: u64, length: u64, actor: LockOwner) -> bool {
        self.owner != actor && self.overlaps(&FileLock { offset, length, owner: actor })
    }
}

/// Lock-conflict detail surfaced by [`crate::error::Error::LockConflict`].
pub type LockConflict = FileLock;

/// Per-open-file ordered lock list, guarded by one mutex (`spec.md` §4.7:
/// "lock lists are mutated only by the file's open-instance owner thread;
/// cross-session reads/writes consult the list under a per-file lock").
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<Vec<FileLock>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self { locks: Mutex::new(Vec::new()) }
    }

    /// Inserts `lock` if it overlaps no existing lock held by a different
    /// owner; otherwise returns the conflicting lock.
    pub fn try_lock(&self, lock: FileLock) -> Result<(), LockConflict> {
        let mut locks = self.locks.lock().expect("lock list poisoned");
        if let Some(existing) = locks.iter().find(|l| l.covers(lock.offset, lock.length, lock.owner)) {
            return Err(*existing);
        }
        locks.push(lock);
        Ok(())
    }

    /// Removes the lock exactly matching `(offset, length)` held by
    /// `owner`; fails with `Err(())` (mapped to `Error::NotLocked` by
    /// callers) if no such entry exists.
    pub fn unlock(&self, offset: u64, length: u64, owner: LockOwner) -> Result<FileLock, ()> {
        let mut locks = self.locks.lock().expect("lock list poisoned");
        let position = locks
            .iter()
            .position(|l| l.offset == offset && l.length == length && l.owner == owner)
            .ok_or(())?;
        Ok(locks.remove(position))
    }

    /// True unless a lock owned by a different owner overlaps the range.
    /// Locks are mandatory; this layer does not distinguish shared vs.
    /// exclusive (`spec.md` §4.7).
    pub fn can_read(&self, offset: u64, length: u64, reader: LockOwner) -> bool {
        self.admits(offset, length, reader)
    }

    pub fn can_write(&self, offset: u64, length: u64, writer: LockOwner) -> bool {
        self.admits(offset, length, writer)
    }

    fn admits(&self, offset: u64, length: u64, actor: LockOwner) -> bool {
        let locks = self.locks.lock().expect("lock list poisoned");
        !locks.iter().any(|l| l.covers(offset, length, actor))
    }

    /// Snapshot of held locks in insertion order, for diagnostics only
    /// (`spec.md` §4.7 "Ordering").
    pub fn snapshot(&self) -> Vec<FileLock> {
        self.locks.lock().expect("lock list poisoned").clone()
    }

    /// Releases every lock held by `owner`, e.g. on session close.
    pub fn release_owner(&self, owner: LockOwner) {
        let mut locks = self.locks.lock().expect("lock list poisoned");
        locks.retain(|l| l.owner != owner);
    }
}
