//! Scripted scenario replay
//!
//! A scenario is a TOML file listing registry and cache operations. Each
//! step runs against in-process registries driven by a `ManualClock`;
//! outbound notifications are captured by a `RecordingTransport` so the
//! effect of every step can be inspected.
//!
//! ```toml
//! start = 1700000000
//! leases = { "uuid-2" = 60 }
//! paths = { "10" = "d:/eos/home/", "0xb" = "f:/eos/home/file" }
//!
//! [[steps]]
//! op = "store"
//! auth_id = "A1"
//! inode = 10
//! client_id = "c1"
//! client_uuid = "uuid-1"
//!
//! [[steps]]
//! op = "release"
//! auth_id = "A1"
//! client_uuid = "uuid-1"
//! ```

use crate::cache::{CacheAuthority, CacheEntryInfo, CacheHandle, CacheWrite};
use crate::caps::{
    BroadcastReport, CapRegistry, Capability, DumpView, Identity, LeaseTable, Metadata,
    Notification, PathResolver, RecordingTransport,
};
use crate::clock::{Clock, ManualClock, Timestamp};
use crate::config::Config;
use crate::error::{FusecapError, FusecapResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// One scripted operation
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Store {
        auth_id: String,
        inode: u64,
        client_id: String,
        client_uuid: String,
        #[serde(default)]
        mode: u32,
        /// Lease from now; absent means valid while the session is open
        lease_secs: Option<u64>,
    },
    Imply {
        inode: u64,
        source: String,
        implied: String,
    },
    Delete {
        inode: u64,
    },
    Release {
        auth_id: String,
        #[serde(default)]
        client_uuid: String,
        #[serde(default)]
        parent_inode: u64,
    },
    Refresh {
        inode: u64,
        parent_inode: u64,
        auth_id: String,
        #[serde(default)]
        client_uuid: String,
    },
    Deletion {
        inode: u64,
        name: String,
        auth_id: String,
        #[serde(default)]
        client_uuid: String,
    },
    Md {
        inode: u64,
        parent_inode: u64,
        auth_id: String,
        #[serde(default)]
        client_uuid: String,
        #[serde(default)]
        clock: u64,
    },
    ReleaseExternal {
        inode: u64,
    },
    Advance {
        secs: u64,
    },
    Sweep,
    CacheCreate {
        inode: u64,
        owner_lifetime_secs: Option<u64>,
    },
    CacheWrite {
        inode: u64,
        #[serde(default)]
        offset: u64,
        data: String,
    },
    CacheClose {
        inode: u64,
    },
    CacheReuse {
        inode: u64,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::Imply { .. } => "imply",
            Self::Delete { .. } => "delete",
            Self::Release { .. } => "release",
            Self::Refresh { .. } => "refresh",
            Self::Deletion { .. } => "deletion",
            Self::Md { .. } => "md",
            Self::ReleaseExternal { .. } => "release_external",
            Self::Advance { .. } => "advance",
            Self::Sweep => "sweep",
            Self::CacheCreate { .. } => "cache_create",
            Self::CacheWrite { .. } => "cache_write",
            Self::CacheClose { .. } => "cache_close",
            Self::CacheReuse { .. } => "cache_reuse",
        }
    }
}

/// A parsed scenario file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Initial clock (epoch seconds); defaults to the current time
    pub start: Option<u64>,
    /// Per-client lease times
    #[serde(default)]
    pub leases: HashMap<String, u64>,
    /// Client uuids whose notifications fail
    #[serde(default)]
    pub unreachable: Vec<String>,
    /// Inode (decimal or 0x-hex) to namespace path, for the path view
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub async fn load(path: &Path) -> FusecapResult<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| FusecapError::io(format!("reading scenario {}", path.display()), e))?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, origin: &Path) -> FusecapResult<Self> {
        let scenario: Self = toml::from_str(content).map_err(|e| invalid(origin, e.to_string()))?;
        scenario.resolver(origin)?;
        Ok(scenario)
    }

    fn resolver(&self, origin: &Path) -> FusecapResult<ScenarioPaths> {
        let mut paths = HashMap::new();
        for (key, path) in &self.paths {
            let inode = match key.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => key.parse(),
            }
            .map_err(|_| invalid(origin, format!("bad inode key '{}' in paths", key)))?;
            paths.insert(inode, path.clone());
        }
        Ok(ScenarioPaths(paths))
    }
}

fn invalid(origin: &Path, reason: String) -> FusecapError {
    FusecapError::ScenarioInvalid {
        path: origin.to_path_buf(),
        reason,
    }
}

struct ScenarioPaths(HashMap<u64, String>);

impl PathResolver for ScenarioPaths {
    fn resolve(&self, inode: u64) -> Option<String> {
        self.0.get(&inode).cloned()
    }
}

/// What one step did
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub op: &'static str,
    pub ok: bool,
    pub result: String,
    pub notifications: Vec<Notification>,
}

/// Scenario runner
pub struct Replay {
    clock: Arc<ManualClock>,
    transport: Arc<RecordingTransport>,
    registry: CapRegistry,
    authority: CacheAuthority,
    handles: HashMap<u64, CacheHandle>,
    paths: ScenarioPaths,
    owner_lifetime_secs: u64,
}

impl Replay {
    pub fn new(scenario: &Scenario, config: &Config) -> FusecapResult<Self> {
        let start = scenario
            .start
            .map(|secs| Timestamp::new(secs, 0))
            .unwrap_or_else(|| ManualClock::starting_now().now());
        let clock = Arc::new(ManualClock::new(start));

        let leases = Arc::new(LeaseTable::new());
        for (uuid, secs) in &scenario.leases {
            leases.set(uuid.clone(), *secs);
        }
        let transport = Arc::new(RecordingTransport::new());
        for uuid in &scenario.unreachable {
            transport.set_unreachable(uuid.clone());
        }

        let registry = CapRegistry::new(
            config.caps.clone(),
            clock.clone(),
            leases,
            transport.clone(),
        );
        let authority = CacheAuthority::new(
            config.cache.clone(),
            config.restore.clone(),
            clock.clone(),
        );

        Ok(Self {
            paths: scenario.resolver(Path::new("<scenario>"))?,
            clock,
            transport,
            registry,
            authority,
            handles: HashMap::new(),
            owner_lifetime_secs: config.cache.owner_lifetime_secs,
        })
    }

    /// Run every step in order; a failing step is recorded, not fatal
    pub async fn run(&mut self, steps: &[Step]) -> Vec<StepRecord> {
        let mut records = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            debug!(index, op = step.name(), "replaying step");
            let (ok, result) = match self.apply(step).await {
                Ok(text) => (true, text),
                Err(e) => (false, e.to_string()),
            };
            records.push(StepRecord {
                index,
                op: step.name(),
                ok,
                result,
                notifications: self.transport.take(),
            });
        }
        info!(steps = records.len(), caps = self.registry.len(), "scenario replayed");
        records
    }

    async fn apply(&mut self, step: &Step) -> FusecapResult<String> {
        match step {
            Step::Store {
                auth_id,
                inode,
                client_id,
                client_uuid,
                mode,
                lease_secs,
            } => {
                let mut cap = Capability {
                    id: *inode,
                    client_id: client_id.clone(),
                    client_uuid: client_uuid.clone(),
                    auth_id: auth_id.clone(),
                    mode: *mode,
                    ..Capability::default()
                };
                if let Some(secs) = lease_secs {
                    cap.set_valid_until(self.clock.now().plus_secs(*secs));
                }
                self.registry.store(cap, Identity::default());
                Ok(format!("stored {}", auth_id))
            }
            Step::Imply {
                inode,
                source,
                implied,
            } => Ok(self.registry.imply(*inode, source, implied).to_string()),
            Step::Delete { inode } => {
                let removed = self.registry.delete(*inode)?;
                Ok(format!("removed {}", removed))
            }
            Step::Release {
                auth_id,
                client_uuid,
                parent_inode,
            } => {
                let md = metadata(auth_id, client_uuid, 0, *parent_inode);
                Ok(report(self.registry.broadcast_release(&md).await))
            }
            Step::Refresh {
                inode,
                parent_inode,
                auth_id,
                client_uuid,
            } => {
                let md = metadata(auth_id, client_uuid, *inode, *parent_inode);
                Ok(report(
                    self.registry.broadcast_refresh(*inode, &md, *parent_inode).await,
                ))
            }
            Step::Deletion {
                inode,
                name,
                auth_id,
                client_uuid,
            } => {
                let md = metadata(auth_id, client_uuid, *inode, 0);
                Ok(report(self.registry.broadcast_deletion(*inode, &md, name).await))
            }
            Step::Md {
                inode,
                parent_inode,
                auth_id,
                client_uuid,
                clock,
            } => {
                let md = metadata(auth_id, client_uuid, *inode, *parent_inode);
                let now = self.clock.now();
                Ok(report(
                    self.registry
                        .broadcast_md(&md, *inode, *parent_inode, *clock, now)
                        .await,
                ))
            }
            Step::ReleaseExternal { inode } => {
                Ok(report(self.registry.broadcast_release_from_external(*inode).await))
            }
            Step::Advance { secs } => {
                self.clock.advance(*secs);
                Ok(format!("now {}", self.clock.now()))
            }
            Step::Sweep => {
                let caps = self.registry.sweep_now();
                let entries = self.authority.sweep_now();
                Ok(format!("expired caps={} cache={}", caps, entries))
            }
            Step::CacheCreate {
                inode,
                owner_lifetime_secs,
            } => {
                let lifetime = owner_lifetime_secs.unwrap_or(self.owner_lifetime_secs);
                let handle = self.authority.acquire_create(*inode, lifetime)?;
                self.handles.insert(*inode, handle);
                Ok(format!("owner lifetime={}s", lifetime))
            }
            Step::CacheWrite { inode, offset, data } => {
                let handle = self.handles.get_mut(inode).ok_or_else(|| {
                    FusecapError::User(format!("no open cache handle for inode {}", inode))
                })?;
                match self.authority.write(handle, *offset, data.as_bytes())? {
                    CacheWrite::Cached(n) => Ok(format!("cached {}", n)),
                    CacheWrite::Overflow { cached } => Ok(format!("overflow cached {}", cached)),
                }
            }
            Step::CacheClose { inode } => {
                let handle = self.handles.remove(inode).ok_or_else(|| {
                    FusecapError::User(format!("no open cache handle for inode {}", inode))
                })?;
                let expires = self.authority.on_close(&handle, true);
                Ok(match expires {
                    Some(at) => format!("lease until {}", at),
                    None => "entry gone".to_string(),
                })
            }
            Step::CacheReuse { inode } => Ok(match self.authority.acquire_reuse(*inode) {
                Some(handle) => format!("hit size={}", handle.size()),
                None => "miss".to_string(),
            }),
        }
    }

    pub fn dump(&self, view: DumpView, filter: Option<&str>) -> FusecapResult<String> {
        self.registry
            .dump(view, filter, Some(&self.paths as &dyn PathResolver))
    }

    pub fn registry(&self) -> &CapRegistry {
        &self.registry
    }

    pub fn cache_entries(&self) -> Vec<CacheEntryInfo> {
        self.authority.entries()
    }
}

fn metadata(auth_id: &str, client_uuid: &str, md_ino: u64, md_pino: u64) -> Metadata {
    Metadata {
        md_ino,
        md_pino,
        auth_id: auth_id.to_string(),
        client_uuid: client_uuid.to_string(),
        ..Metadata::default()
    }
}

fn report(r: BroadcastReport) -> String {
    format!(
        "attempted={} delivered={} failed={}",
        r.attempted, r.delivered, r.failed
    )
}
