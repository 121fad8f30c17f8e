//! Re-upload of a fully cached file to a fresh replica
//!
//! Used when a writer's close (or an earlier write-through) failed. The
//! buffered bytes are streamed in fixed blocks to a newly created replica;
//! on a clean close the replica's new identity is recorded against the old
//! inode until `CacheAuthority::cache_restore` migrates the entry.

use crate::cache::authority::CacheAuthority;
use crate::cache::cgi;
use crate::cache::file::OpenFlags;
use crate::error::{FusecapError, FusecapResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info, warn};

/// Parameters every restore open carries
const RESTORE_PARAMS: &str = "eos.atomic=1&eos.app=restore";

/// Opaque keys copied from the original open into the restore open
const FORWARDED_KEYS: [&str; 4] = [
    "xrd.wantprot",
    "xrd.gsiusrpxy",
    "xrd.k5ccname",
    "eos.encodepath",
];

/// Write access to a replica being created
#[async_trait]
pub trait ReplicaIo: Send {
    async fn open(&mut self, url: &str, flags: OpenFlags, mode: u32, opaque: &str) -> FusecapResult<()>;

    async fn write(&mut self, offset: u64, data: &[u8]) -> FusecapResult<usize>;

    async fn close(&mut self) -> FusecapResult<()>;

    /// URL the last open was redirected to; its query carries `mgm.id`
    fn last_url(&self) -> String;
}

/// The file a restore re-creates
#[derive(Debug, Clone)]
pub struct RestoreTarget {
    pub inode: u64,
    pub url: String,
    /// Opaque string of the original open
    pub opaque: String,
    pub flags: OpenFlags,
    pub mode: u32,
}

impl RestoreTarget {
    /// Opaque string for the restore open
    pub fn params(&self) -> String {
        let original = cgi::import(&self.opaque);
        let mut params = RESTORE_PARAMS.to_string();
        for key in FORWARDED_KEYS {
            if let Some(value) = original.get(key) {
                params.push_str(&format!("&{}={}", key, value));
            }
        }
        params
    }

    pub fn restore_url(&self) -> String {
        cgi::with_query(&self.url, &self.params())
    }
}

impl CacheAuthority {
    /// Restore `target` from its cache entry. Returns the new inode.
    pub async fn restore(&self, target: &RestoreTarget, replica: &mut dyn ReplicaIo) -> FusecapResult<u64> {
        let settings = self.restore_settings().clone();
        if !settings.enabled {
            return Err(FusecapError::RestoreUnavailable {
                inode: target.inode,
                reason: "restore disabled".to_string(),
            });
        }

        let (buffer, size) = self.restore_source(target.inode).map_err(|e| {
            warn!(inode = target.inode, error = %e, "unable to restore");
            e
        })?;
        info!(inode = target.inode, size, "restoring from cache");

        let url = target.restore_url();
        let params = target.params();
        let flags = OpenFlags {
            create: true,
            truncate: true,
            ..target.flags
        };
        let block = settings.block_size.max(1) as u64;
        let snooze = Duration::from_secs(settings.snooze_secs);

        for attempt in 1..=settings.attempts {
            if attempt > 1 {
                tokio::time::sleep(snooze).await;
            }

            if let Err(e) = replica.open(&url, flags, target.mode, &params).await {
                warn!(url = %url, attempt, error = %e, "restore failed to open, snoozing");
                continue;
            }

            let mut offset = 0u64;
            let mut write_failed = false;
            while offset < size {
                let len = block.min(size - offset) as usize;
                let chunk = {
                    let guard = buffer.read();
                    match guard.peek(offset as usize, len) {
                        Some(bytes) => bytes.to_vec(),
                        None => {
                            error!(inode = target.inode, offset, len, "read error while restoring");
                            return Err(FusecapError::RestoreUnavailable {
                                inode: target.inode,
                                reason: format!("cache holds {} of {} bytes", guard.len(), size),
                            });
                        }
                    }
                };

                if let Err(e) = replica.write(offset, &chunk).await {
                    error!(url = %url, offset, error = %e, "write error while restoring");
                    write_failed = true;
                    break;
                }
                info!(inode = target.inode, offset, len, "restored block");
                offset += len as u64;
            }

            let new_inode = cgi::id_from_url(&replica.last_url());

            if write_failed {
                if let Err(e) = replica.close().await {
                    warn!(url = %url, attempt, error = %e, "closing replica after write error failed");
                }
                continue;
            }

            if let Err(e) = replica.close().await {
                warn!(url = %url, attempt, error = %e, "restore failed to close, snoozing");
                continue;
            }

            self.set_restore_inode(target.inode, new_inode);
            info!(
                inode = target.inode,
                new_inode,
                length = size,
                "restored file from cache"
            );
            return Ok(new_inode);
        }

        Err(FusecapError::RestoreExhausted {
            inode: target.inode,
            attempts: settings.attempts,
        })
    }
}
