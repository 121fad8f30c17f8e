//! Invalidation fan-out to capability holders
//!
//! Every broadcast follows the same contract: snapshot the recipients under
//! the shared lock, drop the lock, then call the transport once per
//! recipient. A failing recipient is logged and skipped.

use crate::caps::capability::{AuthId, Capability};
use crate::caps::registry::CapRegistry;
use crate::clock::Timestamp;
use crate::error::{FusecapError, FusecapResult};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Metadata record of the mutation that triggers a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub md_ino: u64,
    pub md_pino: u64,
    /// Capability the mutating client acted under
    pub auth_id: AuthId,
    pub client_uuid: String,
    pub client_id: String,
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: Timestamp,
    pub clock: u64,
}

/// Outbound notification channel to mounted clients
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Ask a client to drop its capability (and cached state) for `inode`
    async fn release_cap(&self, inode: u64, client_uuid: &str, client_id: &str) -> FusecapResult<()>;

    /// Ask a client to re-fetch the metadata of `inode`
    async fn refresh_entry(&self, inode: u64, client_uuid: &str, client_id: &str) -> FusecapResult<()>;

    /// Tell a client that `name` disappeared from directory `inode`
    async fn delete_entry(
        &self,
        inode: u64,
        client_uuid: &str,
        client_id: &str,
        name: &str,
    ) -> FusecapResult<()>;

    /// Push fresh metadata of `md_ino` below `md_pino`
    #[allow(clippy::too_many_arguments)]
    async fn send_md(
        &self,
        md: &Metadata,
        client_uuid: &str,
        client_id: &str,
        md_ino: u64,
        md_pino: u64,
        clock: u64,
        parent_mtime: Timestamp,
    ) -> FusecapResult<()>;

    /// Push a (re-)issued capability to its owner
    async fn send_cap(&self, cap: &Capability) -> FusecapResult<()>;
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Live, notifiable capabilities from an iterator
fn collect_recipients<'a>(
    caps: impl Iterator<Item = &'a Capability>,
    one_per_client: bool,
) -> Vec<Capability> {
    let mut seen = HashSet::new();
    caps.filter(|cap| cap.id != 0)
        .filter(|cap| !one_per_client || seen.insert(cap.client_uuid.clone()))
        .cloned()
        .collect()
}

impl CapRegistry {
    async fn fan_out<F, Fut>(&self, op: &'static str, recipients: Vec<Capability>, send: F) -> BroadcastReport
    where
        F: Fn(Capability) -> Fut,
        Fut: Future<Output = FusecapResult<()>>,
    {
        let attempted = recipients.len();
        let delivered = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let limit = self.settings().broadcast_parallelism.max(1);

        stream::iter(recipients)
            .for_each_concurrent(limit, |cap| {
                let (send, delivered, failed) = (&send, &delivered, &failed);
                async move {
                    let client_uuid = cap.client_uuid.clone();
                    match send(cap).await {
                        Ok(()) => {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(op, client_uuid = %client_uuid, error = %e, "broadcast to client failed");
                        }
                    }
                }
            })
            .await;

        let report = BroadcastReport {
            attempted,
            delivered: delivered.into_inner(),
            failed: failed.into_inner(),
        };
        debug!(op, ?report, "broadcast finished");
        report
    }

    /// Release every capability on `inode` after a change from outside the
    /// capability system
    pub async fn broadcast_release_from_external(&self, inode: u64) -> BroadcastReport {
        info!(id = inode, "broadcast release from external");
        let recipients = collect_recipients(self.read().caps_on(inode), false);

        let transport = self.transport();
        self.fan_out("release-external", recipients, |cap| async move {
            transport
                .release_cap(cap.id, &cap.client_uuid, &cap.client_id)
                .await
        })
        .await
    }

    /// Refresh `inode` at every holder of a capability on `parent_inode`
    pub async fn broadcast_refresh_from_external(&self, inode: u64, parent_inode: u64) -> BroadcastReport {
        info!(id = inode, pid = parent_inode, "broadcast refresh from external");
        let recipients = collect_recipients(self.read().caps_on(parent_inode), false);

        let transport = self.transport();
        self.fan_out("refresh-external", recipients, |cap| async move {
            transport
                .refresh_entry(inode, &cap.client_uuid, &cap.client_id)
                .await
        })
        .await
    }

    /// Release the capabilities of other clients after `md` was changed
    /// through a capability
    pub async fn broadcast_release(&self, md: &Metadata) -> BroadcastReport {
        let recipients = {
            let tables = self.read();
            let refcap = tables.get(&md.auth_id);
            info!(
                id = refcap.id,
                pid = md.md_pino,
                clientid = %refcap.client_id,
                clientuuid = %refcap.client_uuid,
                authid = %refcap.auth_id,
                "broadcast release"
            );
            let target = if refcap.id != 0 { refcap.id } else { md.md_pino };
            collect_recipients(
                tables.caps_on(target).filter(|cap| {
                    cap.auth_id != md.auth_id
                        && cap.client_uuid != refcap.client_uuid
                        && cap.client_uuid != md.client_uuid
                }),
                false,
            )
        };

        let transport = self.transport();
        self.fan_out("release", recipients, |cap| async move {
            transport
                .release_cap(cap.id, &cap.client_uuid, &cap.client_id)
                .await
        })
        .await
    }

    /// Announce the deletion of `name` to every holder on `inode`
    pub async fn broadcast_deletion_from_external(&self, inode: u64, name: &str) -> BroadcastReport {
        info!(id = inode, name, "broadcast deletion from external");
        let recipients = collect_recipients(self.read().caps_on(inode), false);

        let transport = self.transport();
        self.fan_out("deletion-external", recipients, |cap| async move {
            transport
                .delete_entry(cap.id, &cap.client_uuid, &cap.client_id, name)
                .await
        })
        .await
    }

    /// Announce the deletion of `name` to other clients holding the
    /// directory the mutating capability covers
    pub async fn broadcast_deletion(&self, inode: u64, md: &Metadata, name: &str) -> BroadcastReport {
        info!(id = inode, name, "broadcast deletion");
        let recipients = {
            let tables = self.read();
            let refcap = tables.get(&md.auth_id);
            collect_recipients(
                tables.caps_on(refcap.id).filter(|cap| {
                    cap.auth_id != refcap.auth_id
                        && cap.client_uuid != refcap.client_uuid
                        && cap.client_uuid != md.client_uuid
                }),
                false,
            )
        };

        let transport = self.transport();
        self.fan_out("deletion", recipients, |cap| async move {
            transport
                .delete_entry(cap.id, &cap.client_uuid, &cap.client_id, name)
                .await
        })
        .await
    }

    /// Refresh `inode` at other clients, resolving recipients through the
    /// capabilities held on `parent_inode`
    pub async fn broadcast_refresh(&self, inode: u64, md: &Metadata, parent_inode: u64) -> BroadcastReport {
        info!(id = inode, parent = parent_inode, "broadcast refresh");
        let recipients = {
            let tables = self.read();
            let refcap = tables.get(&md.auth_id);
            collect_recipients(
                tables.caps_on(parent_inode).filter(|cap| {
                    cap.client_uuid != refcap.client_uuid && cap.client_uuid != md.client_uuid
                }),
                false,
            )
        };

        let transport = self.transport();
        self.fan_out("refresh", recipients, |cap| async move {
            transport
                .refresh_entry(inode, &cap.client_uuid, &cap.client_id)
                .await
        })
        .await
    }

    /// Push a capability to the client that owns it
    pub async fn broadcast_cap(&self, cap: &Capability) -> BroadcastReport {
        let recipients = if cap.id != 0 {
            vec![cap.clone()]
        } else {
            Vec::new()
        };

        let transport = self.transport();
        self.fan_out("cap", recipients, |cap| async move { transport.send_cap(&cap).await })
            .await
    }

    /// Push `md` once to every other client holding a capability on `md_pino`
    pub async fn broadcast_md(
        &self,
        md: &Metadata,
        md_ino: u64,
        md_pino: u64,
        clock: u64,
        parent_mtime: Timestamp,
    ) -> BroadcastReport {
        let recipients = {
            let tables = self.read();
            let refcap = tables.get(&md.auth_id);
            info!(
                id = refcap.id,
                pid = md_pino,
                clientid = %refcap.client_id,
                clientuuid = %refcap.client_uuid,
                authid = %refcap.auth_id,
                "broadcast md"
            );
            collect_recipients(
                tables.caps_on(md_pino).filter(|cap| {
                    cap.auth_id != md.auth_id
                        && cap.client_uuid != refcap.client_uuid
                        && cap.client_uuid != md.client_uuid
                }),
                true,
            )
        };

        let transport = self.transport();
        self.fan_out("md", recipients, |cap| async move {
            transport
                .send_md(
                    md,
                    &cap.client_uuid,
                    &cap.client_id,
                    md_ino,
                    md_pino,
                    clock,
                    parent_mtime,
                )
                .await
        })
        .await
    }
}

/// A notification captured by `RecordingTransport`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Release {
        inode: u64,
        client_uuid: String,
        client_id: String,
    },
    Refresh {
        inode: u64,
        client_uuid: String,
        client_id: String,
    },
    Delete {
        inode: u64,
        client_uuid: String,
        client_id: String,
        name: String,
    },
    Md {
        inode: u64,
        parent_inode: u64,
        client_uuid: String,
        client_id: String,
        clock: u64,
    },
    Cap {
        inode: u64,
        auth_id: String,
        client_uuid: String,
    },
}

impl Notification {
    pub fn client_uuid(&self) -> &str {
        match self {
            Self::Release { client_uuid, .. }
            | Self::Refresh { client_uuid, .. }
            | Self::Delete { client_uuid, .. }
            | Self::Md { client_uuid, .. }
            | Self::Cap { client_uuid, .. } => client_uuid,
        }
    }
}

/// In-process transport that records what would have been sent
///
/// Clients marked unreachable make every send to them fail.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Notification>>,
    unreachable: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, client_uuid: impl Into<String>) {
        self.unreachable.lock().insert(client_uuid.into());
    }

    /// Drain everything recorded so far
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    fn record(&self, client_uuid: &str, notification: Notification) -> FusecapResult<()> {
        if self.unreachable.lock().contains(client_uuid) {
            return Err(FusecapError::transport(client_uuid, "client unreachable"));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}

#[async_trait]
impl BroadcastTransport for RecordingTransport {
    async fn release_cap(&self, inode: u64, client_uuid: &str, client_id: &str) -> FusecapResult<()> {
        self.record(
            client_uuid,
            Notification::Release {
                inode,
                client_uuid: client_uuid.to_string(),
                client_id: client_id.to_string(),
            },
        )
    }

    async fn refresh_entry(&self, inode: u64, client_uuid: &str, client_id: &str) -> FusecapResult<()> {
        self.record(
            client_uuid,
            Notification::Refresh {
                inode,
                client_uuid: client_uuid.to_string(),
                client_id: client_id.to_string(),
            },
        )
    }

    async fn delete_entry(
        &self,
        inode: u64,
        client_uuid: &str,
        client_id: &str,
        name: &str,
    ) -> FusecapResult<()> {
        self.record(
            client_uuid,
            Notification::Delete {
                inode,
                client_uuid: client_uuid.to_string(),
                client_id: client_id.to_string(),
                name: name.to_string(),
            },
        )
    }

    async fn send_md(
        &self,
        _md: &Metadata,
        client_uuid: &str,
        client_id: &str,
        md_ino: u64,
        md_pino: u64,
        clock: u64,
        _parent_mtime: Timestamp,
    ) -> FusecapResult<()> {
        self.record(
            client_uuid,
            Notification::Md {
                inode: md_ino,
                parent_inode: md_pino,
                client_uuid: client_uuid.to_string(),
                client_id: client_id.to_string(),
                clock,
            },
        )
    }

    async fn send_cap(&self, cap: &Capability) -> FusecapResult<()> {
        self.record(
            &cap.client_uuid,
            Notification::Cap {
                inode: cap.id,
                auth_id: cap.auth_id.clone(),
                client_uuid: cap.client_uuid.clone(),
            },
        )
    }
}
