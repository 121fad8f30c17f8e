//! Capability records

use crate::clock::Timestamp;
use crate::sweep;
use serde::{Deserialize, Serialize};

/// Unique key of a capability grant
pub type AuthId = String;

/// Identity the capability was granted under
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    /// Trace identity of the originating connection
    pub tident: String,
}

/// Time-bounded access grant of one client session over one inode
///
/// Unknown lookups yield the default value, whose `id()` is zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Inode of the metadata entry the grant covers
    pub id: u64,
    pub client_id: String,
    pub client_uuid: String,
    pub auth_id: AuthId,
    /// Permission bits
    pub mode: u32,
    /// Validity end in epoch seconds, 0 means "while the session is open"
    pub vtime: u64,
    pub vtime_ns: u32,
    #[serde(default)]
    pub identity: Identity,
}

impl Capability {
    /// The "not found" capability
    pub fn sentinel() -> Self {
        Self::default()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == 0
    }

    pub fn valid_until(&self) -> Timestamp {
        Timestamp::new(self.vtime, self.vtime_ns)
    }

    pub fn set_valid_until(&mut self, ts: Timestamp) {
        self.vtime = ts.secs;
        self.vtime_ns = ts.nanos;
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        sweep::is_expired(self.vtime, now.secs)
    }

    /// Seconds of validity left, zero once lapsed or for open-ended grants
    pub fn remaining_secs(&self, now: Timestamp) -> u64 {
        self.vtime.saturating_sub(now.secs)
    }

    /// Whether two grants come from the same mounted client session
    pub fn same_session(&self, other: &Capability) -> bool {
        self.client_uuid == other.client_uuid
    }
}
