//! Server-side capability registry
//!
//! One owning table keyed by auth id plus four back-reference indices
//! (by inode, by client, by client and inode, by expiry time). Every index
//! holds only auth ids, and all of them are updated under the same
//! exclusive lock so they never disagree with the owning table.

use crate::caps::broadcast::BroadcastTransport;
use crate::caps::capability::{AuthId, Capability, Identity};
use crate::caps::lease::LeaseSource;
use crate::clock::{Clock, Timestamp};
use crate::config::schema::CapsConfig;
use crate::error::{FusecapError, FusecapResult};
use crate::sweep::ExpirySweeper;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Capability tables guarded by the registry lock
#[derive(Debug, Default)]
pub(crate) struct CapTables {
    caps: HashMap<AuthId, Capability>,
    by_inode: BTreeMap<u64, BTreeSet<AuthId>>,
    by_client: HashMap<String, HashSet<AuthId>>,
    by_client_inode: HashMap<String, HashMap<u64, HashSet<AuthId>>>,
    by_time: BTreeSet<(u64, AuthId)>,
}

impl CapTables {
    /// Lookup for callers already holding the lock
    pub(crate) fn get(&self, auth_id: &str) -> Capability {
        self.caps
            .get(auth_id)
            .cloned()
            .unwrap_or_else(Capability::sentinel)
    }

    pub(crate) fn lookup(&self, auth_id: &str) -> Option<&Capability> {
        self.caps.get(auth_id)
    }

    /// Auth ids indexed under `inode`, including ids whose record is gone
    pub(crate) fn auth_ids_on(&self, inode: u64) -> impl Iterator<Item = &AuthId> {
        self.by_inode.get(&inode).into_iter().flatten()
    }

    /// Live capabilities indexed under `inode`
    pub(crate) fn caps_on(&self, inode: u64) -> impl Iterator<Item = &Capability> {
        self.auth_ids_on(inode).filter_map(|id| self.caps.get(id))
    }

    pub(crate) fn inodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_inode.keys().copied()
    }

    /// Capabilities in expiry order, open-ended grants first
    pub(crate) fn time_ordered(&self) -> impl Iterator<Item = &Capability> {
        self.by_time.iter().filter_map(|(_, id)| self.caps.get(id))
    }

    fn insert(&mut self, cap: Capability) {
        // Re-storing an auth id replaces its old index entries instead of
        // adding a second time slot.
        self.remove(&cap.auth_id);

        let auth_id = cap.auth_id.clone();
        self.by_time.insert((cap.vtime, auth_id.clone()));
        self.by_client
            .entry(cap.client_id.clone())
            .or_default()
            .insert(auth_id.clone());
        self.by_client_inode
            .entry(cap.client_id.clone())
            .or_default()
            .entry(cap.id)
            .or_default()
            .insert(auth_id.clone());
        self.by_inode.entry(cap.id).or_default().insert(auth_id.clone());
        self.caps.insert(auth_id, cap);
    }

    fn remove(&mut self, auth_id: &str) -> Option<Capability> {
        let cap = self.caps.remove(auth_id)?;

        self.by_time.remove(&(cap.vtime, cap.auth_id.clone()));

        if let Some(ids) = self.by_client.get_mut(&cap.client_id) {
            ids.remove(auth_id);
            if ids.is_empty() {
                self.by_client.remove(&cap.client_id);
            }
        }

        if let Some(inodes) = self.by_client_inode.get_mut(&cap.client_id) {
            if let Some(ids) = inodes.get_mut(&cap.id) {
                ids.remove(auth_id);
                if ids.is_empty() {
                    inodes.remove(&cap.id);
                }
            }
            if inodes.is_empty() {
                self.by_client_inode.remove(&cap.client_id);
            }
        }

        if let Some(ids) = self.by_inode.get_mut(&cap.id) {
            ids.remove(auth_id);
            if ids.is_empty() {
                self.by_inode.remove(&cap.id);
            }
        }

        Some(cap)
    }

    fn remove_inode(&mut self, inode: u64) -> Option<usize> {
        let ids = self.by_inode.get(&inode)?.clone();
        let removed = ids.iter().filter(|id| self.remove(id).is_some()).count();
        // Dangling ids would otherwise keep the inode entry alive
        self.by_inode.remove(&inode);
        Some(removed)
    }

    fn sweep(&mut self, now: u64) -> Vec<AuthId> {
        if now <= 1 {
            return Vec::new();
        }

        let expired: Vec<AuthId> = self
            .by_time
            .range((
                Bound::Included((1, String::new())),
                Bound::Excluded((now, String::new())),
            ))
            .map(|(_, id)| id.clone())
            .collect();

        for id in &expired {
            if self.remove(id).is_none() {
                // time slot without an owning record
                self.by_time.retain(|(_, other)| other != id);
            }
        }
        expired
    }
}

/// Registry of every capability the server has handed out
pub struct CapRegistry {
    tables: RwLock<CapTables>,
    clock: Arc<dyn Clock>,
    leases: Arc<dyn LeaseSource>,
    transport: Arc<dyn BroadcastTransport>,
    sweeper: ExpirySweeper,
    settings: CapsConfig,
}

impl CapRegistry {
    /// Create an empty registry
    pub fn new(
        settings: CapsConfig,
        clock: Arc<dyn Clock>,
        leases: Arc<dyn LeaseSource>,
        transport: Arc<dyn BroadcastTransport>,
    ) -> Self {
        Self {
            tables: RwLock::new(CapTables::default()),
            sweeper: ExpirySweeper::new(Duration::from_secs(settings.sweep_interval_secs)),
            clock,
            leases,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &CapsConfig {
        &self.settings
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn transport(&self) -> &dyn BroadcastTransport {
        self.transport.as_ref()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, CapTables> {
        self.tables.read()
    }

    /// Lease seconds for a client, falling back to the configured default
    pub(crate) fn lease_secs(&self, client_uuid: &str) -> u64 {
        self.leases
            .lease_time(client_uuid)
            .filter(|secs| *secs > 0)
            .unwrap_or(self.settings.default_lease_secs)
    }

    /// Insert or overwrite a capability under its auth id
    pub fn store(&self, mut cap: Capability, identity: Identity) {
        info!(
            id = cap.id,
            clientid = %cap.client_id,
            authid = %cap.auth_id,
            "storing capability"
        );
        cap.identity = identity;

        let now = self.clock.now().secs;
        let mut tables = self.tables.write();
        self.maybe_sweep(&mut tables, now);
        tables.insert(cap);
    }

    /// Derive a capability for `inode` from an existing one.
    ///
    /// Returns false when the source is unknown or the implied id is empty.
    pub fn imply(&self, inode: u64, auth_id: &str, implied_auth_id: &str) -> bool {
        info!(
            id = inode,
            authid = auth_id,
            implied_authid = implied_auth_id,
            "implying capability"
        );

        let source = self.get(auth_id);
        if source.is_sentinel() || implied_auth_id.is_empty() {
            return false;
        }

        let lease = self.lease_secs(&source.client_uuid);
        let now = self.clock.now();

        let mut implied = source;
        implied.auth_id = implied_auth_id.to_string();
        implied.id = inode;
        implied.set_valid_until(now.plus_secs(lease));

        let mut tables = self.tables.write();
        self.maybe_sweep(&mut tables, now.secs);
        tables.insert(implied);
        true
    }

    /// Capability stored under `auth_id`, or the sentinel
    pub fn get(&self, auth_id: &str) -> Capability {
        let cap = self.tables.read().get(auth_id);
        if cap.is_sentinel() {
            debug!(authid = auth_id, "capability not found");
        }
        cap
    }

    /// Remove every capability referencing `inode`
    pub fn delete(&self, inode: u64) -> FusecapResult<usize> {
        let removed = self
            .tables
            .write()
            .remove_inode(inode)
            .ok_or(FusecapError::InodeNotTracked(inode))?;
        debug!(id = inode, removed, "deleted capabilities");
        Ok(removed)
    }

    /// Evict expired capabilities now, regardless of the sweep interval
    pub fn sweep_now(&self) -> usize {
        let now = self.clock.now().secs;
        let expired = self.tables.write().sweep(now);
        for id in &expired {
            debug!(authid = %id, "expired capability");
        }
        expired.len()
    }

    fn maybe_sweep(&self, tables: &mut CapTables, now: u64) {
        if self.sweeper.try_claim(now) {
            let expired = tables.sweep(now);
            if !expired.is_empty() {
                info!(count = expired.len(), "swept expired capabilities");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tables.read().caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn caps_for_inode(&self, inode: u64) -> Vec<Capability> {
        self.tables.read().caps_on(inode).cloned().collect()
    }

    pub fn caps_for_client(&self, client_id: &str) -> Vec<Capability> {
        let tables = self.tables.read();
        tables
            .by_client
            .get(client_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.caps.get(id).cloned())
            .collect()
    }

    pub fn caps_for_client_inode(&self, client_id: &str, inode: u64) -> Vec<Capability> {
        let tables = self.tables.read();
        tables
            .by_client_inode
            .get(client_id)
            .and_then(|inodes| inodes.get(&inode))
            .into_iter()
            .flatten()
            .filter_map(|id| tables.caps.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::caps::broadcast::RecordingTransport;
    use crate::caps::lease::LeaseTable;
    use crate::clock::ManualClock;

    pub(crate) const T0: u64 = 1_700_000_000;

    pub(crate) fn cap(auth_id: &str, inode: u64, client: &str, uuid: &str) -> Capability {
        Capability {
            id: inode,
            client_id: client.to_string(),
            client_uuid: uuid.to_string(),
            auth_id: auth_id.to_string(),
            mode: 0o755,
            vtime: 0,
            vtime_ns: 0,
            identity: Identity::default(),
        }
    }

    pub(crate) fn registry() -> (CapRegistry, Arc<ManualClock>, Arc<LeaseTable>) {
        let clock = Arc::new(ManualClock::new(Timestamp::new(T0, 250)));
        let leases = Arc::new(LeaseTable::new());
        let registry = CapRegistry::new(
            CapsConfig::default(),
            clock.clone(),
            leases.clone(),
            Arc::new(RecordingTransport::new()),
        );
        (registry, clock, leases)
    }

    #[test]
    fn store_then_get() {
        let (registry, _, _) = registry();
        registry.store(cap("a1", 10, "c1", "u1"), Identity::default());

        let got = registry.get("a1");
        assert_eq!(got.auth_id, "a1");
        assert_eq!(got.client_id, "c1");
        assert_eq!(got.id, 10);
    }

    #[test]
    fn get_unknown_returns_sentinel() {
        let (registry, _, _) = registry();
        assert!(registry.get("missing").is_sentinel());
    }

    #[test]
    fn store_records_identity() {
        let (registry, _, _) = registry();
        let identity = Identity {
            uid: 1000,
            gid: 100,
            name: "alice".into(),
            tident: "alice.1:2@host".into(),
        };
        registry.store(cap("a1", 10, "c1", "u1"), identity.clone());
        assert_eq!(registry.get("a1").identity, identity);
    }

    #[test]
    fn restore_same_auth_id_keeps_single_time_slot() {
        let (registry, _, _) = registry();
        let mut first = cap("a1", 10, "c1", "u1");
        first.vtime = T0 + 10;
        registry.store(first, Identity::default());

        let mut second = cap("a1", 10, "c1", "u1");
        second.vtime = T0 + 20;
        registry.store(second, Identity::default());

        let tables = registry.read();
        assert_eq!(tables.by_time.len(), 1);
        assert!(tables.by_time.contains(&(T0 + 20, "a1".to_string())));
    }

    #[test]
    fn restore_with_new_inode_moves_indices() {
        let (registry, _, _) = registry();
        registry.store(cap("a1", 10, "c1", "u1"), Identity::default());
        registry.store(cap("a1", 11, "c1", "u1"), Identity::default());

        assert!(registry.caps_for_inode(10).is_empty());
        assert_eq!(registry.caps_for_inode(11).len(), 1);
        assert!(registry.caps_for_client_inode("c1", 10).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn imply_uses_default_lease() {
        let (registry, _, _) = registry();
        registry.store(cap("a1", 10, "c1", "u1"), Identity::default());

        assert!(registry.imply(11, "a1", "a2"));
        let implied = registry.get("a2");
        assert_eq!(implied.id, 11);
        assert_eq!(implied.client_id, "c1");
        assert_eq!(implied.mode, 0o755);
        assert_eq!(implied.vtime, T0 + 300);
        assert_eq!(implied.vtime_ns, 250);
        assert_eq!(registry.caps_for_client_inode("c1", 11).len(), 1);
    }

    #[test]
    fn imply_uses_client_lease() {
        let (registry, _, leases) = registry();
        leases.set("u1", 45);
        registry.store(cap("a1", 10, "c1", "u1"), Identity::default());

        assert!(registry.imply(11, "a1", "a2"));
        assert_eq!(registry.get("a2").vtime, T0 + 45);
    }

    #[test]
    fn imply_rejects_unknown_source_or_empty_id() {
        let (registry, _, _) = registry();
        assert!(!registry.imply(11, "missing", "a2"));

        registry.store(cap("a1", 10, "c1", "u1"), Identity::default());
        assert!(!registry.imply(11, "a1", ""));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn delete_removes_all_caps_of_inode() {
        let (registry, _, _) = registry();
        registry.store(cap("a1", 10, "c1", "u1"), Identity::default());
        registry.store(cap("a2", 10, "c2", "u2"), Identity::default());
        registry.store(cap("a3", 12, "c1", "u1"), Identity::default());

        assert_eq!(registry.delete(10).unwrap(), 2);
        assert!(registry.get("a1").is_sentinel());
        assert!(registry.get("a2").is_sentinel());
        assert!(!registry.get("a3").is_sentinel());
        assert_eq!(registry.caps_for_client("c1").len(), 1);
        assert!(registry.caps_for_client("c2").is_empty());
    }

    #[test]
    fn delete_untracked_inode_is_not_found() {
        let (registry, _, _) = registry();
        assert!(matches!(
            registry.delete(99),
            Err(FusecapError::InodeNotTracked(99))
        ));
    }

    #[test]
    fn sweep_spares_open_ended_and_future_caps() {
        let (registry, clock, _) = registry();
        let mut expiring = cap("a1", 10, "c1", "u1");
        expiring.vtime = T0 + 5;
        let mut future = cap("a2", 10, "c2", "u2");
        future.vtime = T0 + 500;
        registry.store(expiring, Identity::default());
        registry.store(future, Identity::default());
        registry.store(cap("a3", 10, "c3", "u3"), Identity::default());

        clock.advance(6);
        assert_eq!(registry.sweep_now(), 1);
        assert!(registry.get("a1").is_sentinel());
        assert!(!registry.get("a2").is_sentinel());
        assert!(!registry.get("a3").is_sentinel());
        assert_eq!(registry.caps_for_inode(10).len(), 2);
    }

    #[test]
    fn sweep_keeps_cap_expiring_exactly_now() {
        let (registry, clock, _) = registry();
        let mut c = cap("a1", 10, "c1", "u1");
        c.vtime = T0 + 5;
        registry.store(c, Identity::default());
        clock.advance(5);
        assert_eq!(registry.sweep_now(), 0);
    }

    #[test]
    fn store_piggybacks_sweep() {
        let (registry, clock, _) = registry();
        let mut c = cap("a1", 10, "c1", "u1");
        c.vtime = T0 + 1;
        registry.store(c, Identity::default());

        clock.advance(10);
        registry.store(cap("a2", 11, "c1", "u1"), Identity::default());
        assert!(registry.get("a1").is_sentinel());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_store_and_sweep_keep_indices_consistent() {
        let (registry, clock, _) = registry();
        let registry = Arc::new(registry);

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let mut c = cap(&format!("a{}-{}", t, i), 100 + i % 7, "c1", "u1");
                        c.vtime = if i % 2 == 0 { 0 } else { T0 + 1 };
                        registry.store(c, Identity::default());
                    }
                })
            })
            .collect();
        let sweeper = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    registry.sweep_now();
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        sweeper.join().unwrap();

        clock.advance(10);
        registry.sweep_now();

        let tables = registry.read();
        assert_eq!(tables.caps.len(), 400);
        assert_eq!(tables.by_time.len(), 400);
        for ids in tables.by_inode.values() {
            assert!(ids.iter().all(|id| tables.caps.contains_key(id)));
        }
    }
}
