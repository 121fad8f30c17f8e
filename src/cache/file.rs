//! Cache-aware wrapper around a remote file layout

use crate::cache::authority::{CacheAuthority, CacheHandle, CacheWrite};
use crate::cache::cgi;
use crate::cache::restore::{ReplicaIo, RestoreTarget};
use crate::clock::Timestamp;
use crate::error::{FusecapError, FusecapResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Open mode of a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    /// Create (and truncate) for writing
    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mtime: Timestamp,
}

/// Lower-level file access the cache layers on top of
#[async_trait]
pub trait LayoutFile: Send {
    async fn open(&mut self, path: &str, flags: OpenFlags, mode: u32, opaque: &str) -> FusecapResult<()>;
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> FusecapResult<usize>;
    async fn write(&mut self, offset: u64, data: &[u8]) -> FusecapResult<usize>;
    async fn truncate(&mut self, size: u64) -> FusecapResult<()>;
    async fn close(&mut self) -> FusecapResult<()>;
    async fn stat(&mut self) -> FusecapResult<FileStat>;
    /// URL of the last open after redirection
    fn last_url(&self) -> String;
}

/// An open file whose writes are buffered in the cache authority
pub struct CachedFile<F: LayoutFile> {
    inner: F,
    authority: Arc<CacheAuthority>,
    replica: Option<Box<dyn ReplicaIo>>,
    handle: Option<CacheHandle>,
    path: String,
    opaque: String,
    flags: OpenFlags,
    mode: u32,
    inode: u64,
    size: u64,
    open: bool,
    needs_restore: bool,
}

impl<F: LayoutFile> CachedFile<F> {
    pub fn new(inner: F, authority: Arc<CacheAuthority>) -> Self {
        Self {
            inner,
            authority,
            replica: None,
            handle: None,
            path: String::new(),
            opaque: String::new(),
            flags: OpenFlags::default(),
            mode: 0,
            inode: 0,
            size: 0,
            open: false,
            needs_restore: false,
        }
    }

    /// Replica used to restore this file if its close fails
    pub fn with_replica(mut self, replica: Box<dyn ReplicaIo>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Open the file and claim (create) or share (read) its cache entry.
    /// Writers that do not create go straight to the lower file.
    pub async fn open(
        &mut self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        opaque: &str,
        owner_lifetime_secs: u64,
    ) -> FusecapResult<()> {
        self.inner.open(path, flags, mode, opaque).await?;
        self.open = true;
        self.path = path.to_string();
        self.opaque = opaque.to_string();
        self.flags = flags;
        self.mode = mode;
        self.inode = cgi::id_from_url(&self.inner.last_url());
        self.size = self.inner.stat().await.map(|st| st.size).unwrap_or(0);

        if self.inode == 0 {
            debug!(path, "no file id in redirect, caching disabled");
            return Ok(());
        }

        if flags.create {
            match self.authority.acquire_create(self.inode, owner_lifetime_secs) {
                Ok(handle) => {
                    self.size = 0;
                    self.handle = Some(handle);
                }
                Err(e) => {
                    if let Err(close_err) = self.inner.close().await {
                        warn!(path, error = %close_err, "close after ownership conflict failed");
                    }
                    self.open = false;
                    return Err(e);
                }
            }
        } else if !flags.write {
            if let Some(handle) = self.authority.acquire_reuse(self.inode) {
                self.size = handle.size();
                self.handle = Some(handle);
            }
        }
        debug!(path, inode = self.inode, cached = self.handle.is_some(), "opened");
        Ok(())
    }

    pub async fn read(&mut self, offset: u64, buf: &mut [u8]) -> FusecapResult<usize> {
        if let Some(handle) = &self.handle {
            let len = buf.len().min(self.size.saturating_sub(offset) as usize);
            if let Some(n) = self.authority.read(handle, offset, &mut buf[..len]) {
                if n == len {
                    return Ok(n);
                }
            }
        }
        self.inner.read(offset, buf).await
    }

    /// Buffer then write through; a failed write-through of fully cached
    /// bytes is deferred to restore on close
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> FusecapResult<usize> {
        let fully_cached = match self.handle.as_mut() {
            Some(handle) => match self.authority.write(handle, offset, data) {
                Ok(CacheWrite::Cached(_)) => true,
                Ok(CacheWrite::Overflow { .. }) => false,
                Err(FusecapError::OwnershipConflict { inode }) => {
                    // entry evicted or migrated; continue uncached
                    warn!(path = %self.path, inode, "cache authority lost, writing through");
                    self.handle = None;
                    false
                }
                Err(e) => return Err(e),
            },
            None => false,
        };
        self.size = self.size.max(offset + data.len() as u64);

        match self.inner.write(offset, data).await {
            Ok(n) => Ok(n),
            Err(e) if fully_cached => {
                warn!(path = %self.path, offset, error = %e, "write-through failed, restore scheduled");
                self.needs_restore = true;
                Ok(data.len())
            }
            Err(e) => {
                error!(path = %self.path, offset, error = %e, "write failed");
                Err(e)
            }
        }
    }

    pub async fn truncate(&mut self, size: u64) -> FusecapResult<()> {
        self.inner.truncate(size).await?;
        if self.handle.is_some() {
            self.authority.truncate(self.inode, size);
        }
        self.size = size;
        Ok(())
    }

    pub async fn stat(&mut self) -> FusecapResult<FileStat> {
        let mut st = self.inner.stat().await?;
        if let Some(size) = self.authority.auth_size(self.inode) {
            st.size = size;
        }
        Ok(st)
    }

    /// Close, starting the cache lease for writers and restoring the file
    /// when the close or an earlier write-through failed
    pub async fn close(&mut self) -> FusecapResult<()> {
        if !self.open {
            return Ok(());
        }
        let owns_entry = match &self.handle {
            Some(handle) if handle.is_creator() => {
                self.authority.on_close(handle, self.flags.write);
                true
            }
            _ => false,
        };

        let result = self.inner.close().await;
        self.open = false;

        let outcome = if self.flags.write && (result.is_err() || self.needs_restore) {
            match self.restore(owns_entry).await {
                Ok(new_inode) => {
                    info!(path = %self.path, inode = self.inode, new_inode, "close recovered by restore");
                    Ok(())
                }
                Err(e) => {
                    error!(path = %self.path, inode = self.inode, error = %e, "restore failed");
                    Err(FusecapError::io(
                        format!("closing {}", self.path),
                        e.into_io_error(),
                    ))
                }
            }
        } else {
            result
        };

        self.needs_restore = false;
        self.handle = None;
        outcome
    }

    async fn restore(&mut self, owns_entry: bool) -> FusecapResult<u64> {
        let target = RestoreTarget {
            inode: self.inode,
            url: self.path.clone(),
            opaque: self.opaque.clone(),
            flags: self.flags,
            mode: self.mode,
        };
        let authority = self.authority.clone();
        match self.replica.as_mut() {
            Some(replica) if owns_entry => authority.restore(&target, replica.as_mut()).await,
            _ => Err(FusecapError::RestoreUnavailable {
                inode: self.inode,
                reason: "file is not cached by this writer".to_string(),
            }),
        }
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_cached(&self) -> bool {
        self.handle.is_some()
    }

    pub fn needs_restore(&self) -> bool {
        self.needs_restore
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::authority::tests::authority;
    use crate::cache::restore::tests::MemoryReplica;
    use crate::clock::Clock;

    /// Remote file stub
    #[derive(Default)]
    struct StubLayout {
        inode: u64,
        data: Vec<u8>,
        fail_writes: bool,
        fail_close: bool,
        reads: usize,
    }

    #[async_trait]
    impl LayoutFile for StubLayout {
        async fn open(&mut self, _path: &str, flags: OpenFlags, _mode: u32, _opaque: &str) -> FusecapResult<()> {
            if flags.truncate {
                self.data.clear();
            }
            Ok(())
        }

        async fn read(&mut self, offset: u64, buf: &mut [u8]) -> FusecapResult<usize> {
            self.reads += 1;
            let start = (offset as usize).min(self.data.len());
            let n = buf.len().min(self.data.len() - start);
            buf[..n].copy_from_slice(&self.data[start..start + n]);
            Ok(n)
        }

        async fn write(&mut self, offset: u64, data: &[u8]) -> FusecapResult<usize> {
            if self.fail_writes {
                return Err(FusecapError::Replica("disk gone".into()));
            }
            let end = offset as usize + data.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[offset as usize..end].copy_from_slice(data);
            Ok(data.len())
        }

        async fn truncate(&mut self, size: u64) -> FusecapResult<()> {
            self.data.truncate(size as usize);
            Ok(())
        }

        async fn close(&mut self) -> FusecapResult<()> {
            if self.fail_close {
                return Err(FusecapError::Replica("close failed".into()));
            }
            Ok(())
        }

        async fn stat(&mut self) -> FusecapResult<FileStat> {
            Ok(FileStat {
                size: self.data.len() as u64,
                mtime: Timestamp::default(),
            })
        }

        fn last_url(&self) -> String {
            format!("root://fst//f?mgm.logid=x&mgm.id={:x}", self.inode)
        }
    }

    fn stub(inode: u64) -> StubLayout {
        StubLayout {
            inode,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writer_close_opens_reuse_window() {
        let (authority, clock) = authority();
        let mut writer = CachedFile::new(stub(42), authority.clone());
        writer.open("/eos/f", OpenFlags::create(), 0o644, "", 60).await.unwrap();
        assert_eq!(writer.inode(), 42);
        assert!(writer.is_cached());
        writer.write(0, b"cached bytes").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(authority.entry(42).unwrap().lifetime, clock.now().secs + 60);

        let mut reader = CachedFile::new(stub(42), authority.clone());
        reader.open("/eos/f", OpenFlags::read_only(), 0, "", 60).await.unwrap();
        assert_eq!(reader.size(), 12);

        let mut buf = [0u8; 6];
        assert_eq!(reader.read(7, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"bytes");
        assert_eq!(reader.inner().reads, 0);
        reader.close().await.unwrap();
        assert_eq!(authority.entry(42).unwrap().lifetime, clock.now().secs + 60);
    }

    #[tokio::test]
    async fn second_creator_is_refused() {
        let (authority, _) = authority();
        let mut first = CachedFile::new(stub(5), authority.clone());
        first.open("/eos/a", OpenFlags::create(), 0o644, "", 60).await.unwrap();

        let mut second = CachedFile::new(stub(5), authority.clone());
        let err = second
            .open("/eos/a", OpenFlags::create(), 0o644, "", 60)
            .await
            .unwrap_err();
        assert!(matches!(err, FusecapError::OwnershipConflict { inode: 5 }));
    }

    #[tokio::test]
    async fn failed_write_through_is_restored_on_close() {
        let (authority, _) = authority();
        let replica = MemoryReplica {
            new_inode: 0x99,
            ..Default::default()
        };
        let mut file = CachedFile::new(
            StubLayout {
                inode: 7,
                fail_writes: true,
                ..Default::default()
            },
            authority.clone(),
        )
        .with_replica(Box::new(replica));

        file.open("root://mgm//eos/f", OpenFlags::create(), 0o644, "", 60).await.unwrap();
        assert_eq!(file.write(0, b"abc").await.unwrap(), 3);
        assert!(file.needs_restore());

        file.close().await.unwrap();
        assert_eq!(authority.cache_restore(7), Some(0x99));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_restore_surfaces_io_error() {
        let (authority, _) = authority();
        let replica = MemoryReplica {
            fail_opens: 3,
            ..Default::default()
        };
        let mut file = CachedFile::new(
            StubLayout {
                inode: 8,
                fail_close: true,
                ..Default::default()
            },
            authority.clone(),
        )
        .with_replica(Box::new(replica));

        file.open("root://mgm//eos/g", OpenFlags::create(), 0o644, "", 60).await.unwrap();
        file.write(0, b"abc").await.unwrap();

        let err = file.close().await.unwrap_err();
        let io = err.into_io_error();
        assert!(io.to_string().contains("failed after 3 attempts"));
    }

    #[tokio::test]
    async fn read_only_close_failure_is_plain_error() {
        let (authority, _) = authority();
        let mut file = CachedFile::new(
            StubLayout {
                inode: 9,
                fail_close: true,
                ..Default::default()
            },
            authority,
        );
        file.open("/eos/h", OpenFlags::read_only(), 0, "", 60).await.unwrap();
        let err = file.close().await.unwrap_err();
        assert!(matches!(err, FusecapError::Replica(_)));
    }

    #[tokio::test]
    async fn truncate_updates_cached_size() {
        let (authority, _) = authority();
        let mut file = CachedFile::new(stub(12), authority.clone());
        file.open("/eos/t", OpenFlags::create(), 0o644, "", 60).await.unwrap();
        file.write(0, b"0123456789").await.unwrap();
        file.truncate(4).await.unwrap();

        assert_eq!(authority.auth_size(12), Some(4));
        assert_eq!(file.stat().await.unwrap().size, 4);

        let mut buf = [0u8; 10];
        assert_eq!(file.read(0, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"0123");
    }

    #[tokio::test]
    async fn plain_writer_bypasses_cached_entry() {
        let (authority, clock) = authority();
        let mut creator = CachedFile::new(stub(42), authority.clone());
        creator.open("/eos/f", OpenFlags::create(), 0o644, "", 60).await.unwrap();
        creator.write(0, b"AAAA").await.unwrap();
        creator.close().await.unwrap();
        let expires = authority.entry(42).unwrap().lifetime;

        clock.advance(10);
        let mut writer = CachedFile::new(stub(42), authority.clone());
        writer.open("/eos/f", OpenFlags::write_only(), 0o644, "", 60).await.unwrap();
        assert!(!writer.is_cached());

        writer.write(0, b"BBBB").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(writer.read(0, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"BBBB");

        writer.close().await.unwrap();
        assert_eq!(authority.entry(42).unwrap().lifetime, expires);
    }

    #[tokio::test]
    async fn plain_writer_close_failure_does_not_restore_cached_bytes() {
        let (authority, _) = authority();
        let mut creator = CachedFile::new(stub(43), authority.clone());
        creator.open("/eos/f", OpenFlags::create(), 0o644, "", 60).await.unwrap();
        creator.write(0, b"AAAA").await.unwrap();
        creator.close().await.unwrap();

        let replica = MemoryReplica {
            new_inode: 0x77,
            ..Default::default()
        };
        let mut writer = CachedFile::new(
            StubLayout {
                inode: 43,
                fail_close: true,
                ..Default::default()
            },
            authority.clone(),
        )
        .with_replica(Box::new(replica));
        writer.open("/eos/f", OpenFlags::write_only(), 0o644, "", 60).await.unwrap();
        writer.write(0, b"BBBB").await.unwrap();

        let err = writer.close().await.unwrap_err();
        assert!(matches!(err, FusecapError::Io { .. }));
        assert_eq!(authority.cache_restore(43), None);
    }

    #[tokio::test]
    async fn evicted_entry_falls_back_to_write_through() {
        let (authority, _) = authority();
        let mut file = CachedFile::new(stub(44), authority.clone());
        file.open("/eos/e", OpenFlags::create(), 0o644, "", 60).await.unwrap();
        file.write(0, b"abc").await.unwrap();

        assert!(authority.remove(44));
        assert_eq!(file.write(3, b"def").await.unwrap(), 3);
        assert!(!file.is_cached());
        assert_eq!(file.inner().data, b"abcdef");

        file.close().await.unwrap();
        assert!(authority.entry(44).is_none());
    }
}
