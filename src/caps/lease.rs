//! Per-client lease time lookup

use parking_lot::RwLock;
use std::collections::HashMap;

/// Lease time used when a client has not announced one
pub const DEFAULT_LEASE_SECS: u64 = 300;

/// Source of the lease duration a client session negotiated at mount time
pub trait LeaseSource: Send + Sync {
    /// Lease seconds for `client_uuid`, `None` when unknown or unset
    fn lease_time(&self, client_uuid: &str) -> Option<u64>;
}

/// In-memory lease table keyed by client uuid
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: RwLock<HashMap<String, u64>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the lease a client announced; zero clears it
    pub fn set(&self, client_uuid: impl Into<String>, secs: u64) {
        let client_uuid = client_uuid.into();
        let mut leases = self.leases.write();
        if secs == 0 {
            leases.remove(&client_uuid);
        } else {
            leases.insert(client_uuid, secs);
        }
    }

    pub fn remove(&self, client_uuid: &str) {
        self.leases.write().remove(client_uuid);
    }
}

impl LeaseSource for LeaseTable {
    fn lease_time(&self, client_uuid: &str) -> Option<u64> {
        self.leases.read().get(client_uuid).copied()
    }
}
