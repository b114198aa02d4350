//! Inheritable descriptor bookkeeping for direct spawns
//!
//! Every descriptor this crate opens is close-on-exec. Before a fork the
//! descriptors the child needs are collected in an [`InheritableFdStore`],
//! which hands back a descriptor number that survives `execve`:
//!
//! - a descriptor that is already inheritable is used as is
//! - otherwise a duplicate without `FD_CLOEXEC` is created and owned by the
//!   store
//!
//! Owned duplicates are closed when the store is dropped; caller descriptors
//! are never touched. The store is only alive while the process-wide spawn
//! lock is held, so concurrent spawns never see each other's duplicates.

// Adopting descriptors returned by fcntl requires from_raw_fd
#![allow(unsafe_code)]

use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use tracing::debug;

/// Serialises the window in which inheritable duplicates exist
pub(crate) static SPAWN_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug)]
struct Slot {
    source: RawFd,
    alias: RawFd,
    owned: Option<OwnedFd>,
}

/// Set of descriptors to be inherited by the next spawned child
#[derive(Debug, Default)]
pub struct InheritableFdStore {
    slots: Vec<Slot>,
}

impl InheritableFdStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fd` inheritable and return the descriptor number to pass to the
    /// child.
    ///
    /// Adding the same descriptor (or an alias this store produced) again
    /// returns the alias from the first call.
    pub fn add(&mut self, fd: BorrowedFd<'_>) -> Result<RawFd> {
        let raw = fd.as_raw_fd();
        if let Some(slot) = self
            .slots
            .iter()
            .find(|s| s.source == raw || s.alias == raw)
        {
            return Ok(slot.alias);
        }

        let flags = fcntl(raw, FcntlArg::F_GETFD)
            .map_err(|e| CoreError::spawn_errno(e, format!("F_GETFD on descriptor {raw}")))?;
        if !FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC) {
            self.slots.push(Slot {
                source: raw,
                alias: raw,
                owned: None,
            });
            return Ok(raw);
        }

        // Above the stdio range so that dup2 onto 0..=2 never clobbers it
        let dup = fcntl(raw, FcntlArg::F_DUPFD(3))
            .map_err(|e| CoreError::spawn_errno(e, format!("dup of descriptor {raw}")))?;
        // SAFETY: F_DUPFD returned a fresh descriptor that nothing else owns
        let owned = unsafe { OwnedFd::from_raw_fd(dup) };
        debug!("Created inheritable duplicate {} of {}", dup, raw);
        self.slots.push(Slot {
            source: raw,
            alias: dup,
            owned: Some(owned),
        });
        Ok(dup)
    }

    /// Number of distinct descriptors in the inheritable set
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing has been added
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of duplicates created (and to be closed) by this store
    pub fn owned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.owned.is_some()).count()
    }

    /// Descriptor numbers of the inheritable set
    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.slots.iter().map(|s| s.alias)
    }

    /// Duplicates owned by this store; the child closes them after moving
    /// them onto their final numbers
    pub fn owned_aliases(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .filter(|s| s.owned.is_some())
            .map(|s| s.alias)
            .collect()
    }
}

/// Whether `fd` refers to an open descriptor
pub(crate) fn is_valid_fd(fd: RawFd) -> bool {
    !matches!(fcntl(fd, FcntlArg::F_GETFD), Err(Errno::EBADF))
}
