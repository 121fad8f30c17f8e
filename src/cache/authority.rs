//! Per-inode write-back ownership table
//!
//! One entry per inode. The map mutex guards the table structure and the
//! entry metadata; the buffer has its own lock and is written only through
//! the creator's [`CacheHandle`].

use crate::cache::buffer::CacheBuffer;
use crate::clock::Clock;
use crate::config::schema::{CacheConfig, RestoreConfig};
use crate::error::{FusecapError, FusecapResult};
use crate::sweep::{is_expired, ExpirySweeper};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Buffer shared between the creator and reusing handles
pub type SharedBuffer = Arc<RwLock<CacheBuffer>>;

#[derive(Debug)]
struct CacheEntry {
    buffer: SharedBuffer,
    size: u64,
    lifetime: u64,
    owner_lifetime: u64,
    partial: bool,
    restore_inode: u64,
}

impl CacheEntry {
    fn is_live(&self, now: u64) -> bool {
        self.lifetime == 0 || now < self.lifetime
    }

    /// Closed by its writer and still inside the reuse window
    fn is_leased(&self, now: u64) -> bool {
        self.lifetime != 0 && now < self.lifetime
    }

    fn info(&self, inode: u64) -> CacheEntryInfo {
        CacheEntryInfo {
            inode,
            size: self.size,
            buffered: self.buffer.read().len() as u64,
            lifetime: self.lifetime,
            owner_lifetime: self.owner_lifetime,
            partial: self.partial,
            restore_inode: self.restore_inode,
        }
    }
}

/// Copy of an entry's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntryInfo {
    pub inode: u64,
    pub size: u64,
    pub buffered: u64,
    pub lifetime: u64,
    pub owner_lifetime: u64,
    pub partial: bool,
    pub restore_inode: u64,
}

/// Outcome of a cached write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    /// All bytes are in the buffer
    Cached(usize),
    /// The write crossed `max_cache_bytes`; only the first `cached` bytes
    /// were buffered and the entry is now partial
    Overflow { cached: usize },
}

/// One open file's view of a cache entry
#[derive(Debug)]
pub struct CacheHandle {
    inode: u64,
    buffer: SharedBuffer,
    size: u64,
    creator: bool,
    max_offset: usize,
}

impl CacheHandle {
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Logical size observed when the handle was acquired
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_creator(&self) -> bool {
        self.creator
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        if self.creator {
            self.buffer.write().truncate(self.max_offset);
        }
    }
}

/// Client-side cache authority
pub struct CacheAuthority {
    entries: Mutex<HashMap<u64, CacheEntry>>,
    clock: Arc<dyn Clock>,
    sweeper: ExpirySweeper,
    settings: CacheConfig,
    restore: RestoreConfig,
}

impl CacheAuthority {
    pub fn new(settings: CacheConfig, restore: RestoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            sweeper: ExpirySweeper::new(Duration::from_secs(settings.sweep_interval_secs)),
            clock,
            settings,
            restore,
        }
    }

    pub fn settings(&self) -> &CacheConfig {
        &self.settings
    }

    pub(crate) fn restore_settings(&self) -> &RestoreConfig {
        &self.restore
    }

    /// Claim create ownership of `inode` with a fresh empty buffer.
    ///
    /// Fails with `OwnershipConflict` while another unexpired entry exists.
    pub fn acquire_create(&self, inode: u64, owner_lifetime_secs: u64) -> FusecapResult<CacheHandle> {
        let now = self.clock.now().secs;
        let mut entries = self.entries.lock();
        self.maybe_sweep(&mut entries, now);

        if entries.get(&inode).is_some_and(|e| e.is_live(now)) {
            debug!(inode, "cache owner-authority already held");
            return Err(FusecapError::OwnershipConflict { inode });
        }

        let buffer = SharedBuffer::default();
        entries.insert(
            inode,
            CacheEntry {
                buffer: buffer.clone(),
                size: 0,
                lifetime: 0,
                owner_lifetime: owner_lifetime_secs,
                partial: false,
                restore_inode: 0,
            },
        );
        info!(inode, owner_lifetime_secs, "acquired cache owner-authority");

        Ok(CacheHandle {
            inode,
            buffer,
            size: 0,
            creator: true,
            max_offset: 0,
        })
    }

    /// Share an entry whose writer has closed and whose lease is running.
    /// None is a plain cache miss, including while the writer is still open.
    pub fn acquire_reuse(&self, inode: u64) -> Option<CacheHandle> {
        let now = self.clock.now().secs;
        let mut entries = self.entries.lock();
        self.maybe_sweep(&mut entries, now);

        let entry = entries.get(&inode).filter(|e| e.is_leased(now))?;
        let max_offset = entry.buffer.read().len();
        info!(inode, cache_size = max_offset, file_size = entry.size, "reusing cache owner-authority");

        Some(CacheHandle {
            inode,
            buffer: entry.buffer.clone(),
            size: entry.size,
            creator: false,
            max_offset,
        })
    }

    /// Buffer a write through the creator handle.
    ///
    /// The logical size always grows to `offset + len`. Bytes at or beyond
    /// `max_cache_bytes` are not buffered and mark the entry partial.
    pub fn write(&self, handle: &mut CacheHandle, offset: u64, data: &[u8]) -> FusecapResult<CacheWrite> {
        let end = offset.saturating_add(data.len() as u64);
        let max = self.settings.max_cache_bytes;
        {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&handle.inode)
                .filter(|e| handle.creator && Arc::ptr_eq(&e.buffer, &handle.buffer))
                .ok_or(FusecapError::OwnershipConflict { inode: handle.inode })?;
            entry.size = entry.size.max(end);
            if end > max {
                entry.partial = true;
            }
        }

        let keep = if end > max {
            usize::try_from(max.saturating_sub(offset)).unwrap_or(usize::MAX).min(data.len())
        } else {
            data.len()
        };

        let mut buffer = handle.buffer.write();
        buffer.reserve_min(self.settings.min_buffer_bytes);
        if keep > 0 {
            // keep > 0 implies offset < max_cache_bytes
            let start = offset as usize;
            buffer.write_at(start, &data[..keep]);
            handle.max_offset = handle.max_offset.max(start + keep);
        }

        if keep < data.len() {
            debug!(inode = handle.inode, offset, cached = keep, "write exceeds cache capacity");
            Ok(CacheWrite::Overflow { cached: keep })
        } else {
            Ok(CacheWrite::Cached(keep))
        }
    }

    /// Serve a read from the buffer; None when the range is not cacheable
    pub fn read(&self, handle: &CacheHandle, offset: u64, buf: &mut [u8]) -> Option<usize> {
        let end = offset.checked_add(buf.len() as u64)?;
        if end > self.settings.max_cache_bytes {
            return None;
        }
        let start = usize::try_from(offset).ok()?;
        Some(handle.buffer.read().read_at(start, buf))
    }

    /// Set the logical size; the buffer itself is left alone
    pub fn truncate(&self, inode: u64, size: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&inode) {
            entry.size = size;
        }
    }

    /// Start the reuse window of a writer's entry. Returns the new expiry.
    pub fn on_close(&self, handle: &CacheHandle, was_writer: bool) -> Option<u64> {
        if !was_writer {
            return None;
        }
        let now = self.clock.now().secs;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&handle.inode)
            .filter(|e| Arc::ptr_eq(&e.buffer, &handle.buffer))?;
        entry.lifetime = now + entry.owner_lifetime;
        info!(
            inode = handle.inode,
            expires = entry.lifetime,
            owner_lifetime = entry.owner_lifetime,
            "cache owner-authority expiry defined"
        );
        Some(entry.lifetime)
    }

    /// Last known size of `inode` while its entry is unexpired
    pub fn auth_size(&self, inode: u64) -> Option<u64> {
        let now = self.clock.now().secs;
        let entries = self.entries.lock();
        let entry = entries.get(&inode)?;
        if entry.is_live(now) {
            Some(entry.size)
        } else {
            debug!(inode, size = entry.size, "found expired cache owner-authority");
            None
        }
    }

    /// Drop the entry of `inode`, e.g. after a confirmed remote deletion
    pub fn remove(&self, inode: u64) -> bool {
        let removed = self.entries.lock().remove(&inode).is_some();
        if removed {
            info!(inode, "removed cache owner-authority");
        }
        removed
    }

    /// Move a restored entry under its new inode, once
    pub fn cache_restore(&self, old_inode: u64) -> Option<u64> {
        let mut entries = self.entries.lock();
        let new_inode = entries.get(&old_inode).map(|e| e.restore_inode).filter(|&i| i != 0)?;
        let mut entry = entries.remove(&old_inode)?;
        entry.restore_inode = 0;
        entries.insert(new_inode, entry);
        info!(old_inode, new_inode, "migrated cache owner-authority");
        Some(new_inode)
    }

    pub(crate) fn set_restore_inode(&self, old_inode: u64, new_inode: u64) -> bool {
        match self.entries.lock().get_mut(&old_inode) {
            Some(entry) => {
                entry.restore_inode = new_inode;
                true
            }
            None => false,
        }
    }

    /// Buffer and logical size for a restore, refusing partial entries
    pub(crate) fn restore_source(&self, inode: u64) -> FusecapResult<(SharedBuffer, u64)> {
        let entries = self.entries.lock();
        match entries.get(&inode) {
            None => Err(FusecapError::RestoreUnavailable {
                inode,
                reason: "no cache entry".to_string(),
            }),
            Some(entry) if entry.partial => Err(FusecapError::RestoreUnavailable {
                inode,
                reason: format!("partially cached (size {})", entry.size),
            }),
            Some(entry) => Ok((entry.buffer.clone(), entry.size)),
        }
    }

    pub fn entry(&self, inode: u64) -> Option<CacheEntryInfo> {
        self.entries.lock().get(&inode).map(|e| e.info(inode))
    }

    /// All entries ordered by inode
    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let mut all: Vec<_> = self.entries.lock().iter().map(|(i, e)| e.info(*i)).collect();
        all.sort_by_key(|e| e.inode);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry now, regardless of the sweep interval
    pub fn sweep_now(&self) -> usize {
        let now = self.clock.now().secs;
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries, now)
    }

    fn maybe_sweep(&self, entries: &mut HashMap<u64, CacheEntry>, now: u64) {
        if self.sweeper.try_claim(now) {
            Self::sweep(entries, now);
        }
    }

    fn sweep(entries: &mut HashMap<u64, CacheEntry>, now: u64) -> usize {
        let before = entries.len();
        entries.retain(|inode, entry| {
            let keep = !is_expired(entry.lifetime, now);
            if !keep {
                info!(inode = *inode, "released cache owner-authority");
            }
            keep
        });
        before - entries.len()
    }
}
