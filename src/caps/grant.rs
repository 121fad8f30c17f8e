//! Capability issuance for GETCAP requests

use crate::caps::capability::{AuthId, Capability, Identity};
use crate::caps::registry::CapRegistry;
use crate::error::{FusecapError, FusecapResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

/// A client's request for a capability on one inode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapRequest {
    pub inode: u64,
    pub client_id: String,
    pub client_uuid: String,
    /// Auth id chosen by the client; a fresh one is minted when absent
    pub auth_id: Option<AuthId>,
    pub mode: u32,
    /// Client wall clock (epoch seconds) when the request was sent
    pub client_clock: i64,
    pub identity: Identity,
}

impl CapRegistry {
    /// Reject requests whose sender clock differs from ours by more than
    /// `max_clock_skew_secs`
    pub fn check_clock(&self, client_clock: i64) -> FusecapResult<()> {
        let server_clock = i64::try_from(self.now().secs).unwrap_or(i64::MAX);
        let max_skew = self.settings().max_clock_skew_secs;
        if client_clock.abs_diff(server_clock) > max_skew {
            error!(client_clock, server_clock, "client clock out of sync");
            return Err(FusecapError::ClockSkew {
                client_clock,
                server_clock,
                max_skew,
            });
        }
        Ok(())
    }

    /// Issue and store a capability; the caller pushes it with `broadcast_cap`
    pub fn issue(&self, request: CapRequest) -> FusecapResult<Capability> {
        self.check_clock(request.client_clock)?;

        let lease = self.lease_secs(&request.client_uuid);
        let auth_id = request
            .auth_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut cap = Capability {
            id: request.inode,
            client_id: request.client_id,
            client_uuid: request.client_uuid,
            auth_id,
            mode: request.mode,
            vtime: 0,
            vtime_ns: 0,
            identity: Identity::default(),
        };
        cap.set_valid_until(self.now().plus_secs(lease));

        info!(id = cap.id, authid = %cap.auth_id, lease, "issued capability");
        self.store(cap.clone(), request.identity.clone());
        cap.identity = request.identity;
        Ok(cap)
    }
}
