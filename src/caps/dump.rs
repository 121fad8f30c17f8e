//! Read-only administrative rendering of the capability registry

use crate::caps::capability::{AuthId, Capability};
use crate::caps::registry::CapRegistry;
use crate::clock::Timestamp;
use crate::error::{FusecapError, FusecapResult};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing::info;

/// Ordering of a registry dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpView {
    /// One line per capability in expiry order
    Time,
    /// Grouped by hexadecimal inode
    Inode,
    /// Grouped by resolved namespace path
    Path,
}

/// Resolves inodes to namespace paths for the path view
pub trait PathResolver: Send + Sync {
    /// Full path, conventionally prefixed `f:` for files and `d:` for containers
    fn resolve(&self, inode: u64) -> Option<String>;
}

fn compile_filter(filter: Option<&str>) -> FusecapResult<Option<Regex>> {
    match filter.filter(|f| !f.is_empty()) {
        None => Ok(None),
        Some(pattern) => RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(Some)
            .map_err(|source| FusecapError::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            }),
    }
}

fn passes(filter: &Option<Regex>, text: &str) -> bool {
    filter.as_ref().map_or(true, |re| re.is_match(text))
}

fn cap_line(out: &mut String, auth_id: &str, cap: Option<&Capability>, now: Timestamp) {
    match cap {
        Some(cap) => {
            let _ = writeln!(
                out,
                "___ a:{} c:{} u:{} m:{:016x} v:{}",
                auth_id,
                cap.client_id,
                cap.client_uuid,
                cap.mode,
                cap.remaining_secs(now)
            );
        }
        None => {
            let _ = writeln!(
                out,
                "___ a:{} c:<unfound> u:<unfound> m:<unfound> v:<unfound>",
                auth_id
            );
        }
    }
}

impl CapRegistry {
    /// Render the registry, optionally keeping only entries matching the
    /// case-insensitive regular expression `filter`
    pub fn dump(
        &self,
        view: DumpView,
        filter: Option<&str>,
        resolver: Option<&dyn PathResolver>,
    ) -> FusecapResult<String> {
        info!(?view, filter = filter.unwrap_or(""), "dumping capabilities");
        let filter = compile_filter(filter)?;
        let now = self.now();
        let mut out = String::new();

        match view {
            DumpView::Time => {
                let caps: Vec<Capability> = self.read().time_ordered().cloned().collect();
                for cap in caps {
                    let line = format!(
                        "# i:{:016x} a:{} c:{} u:{} m:{:08x} v:{}\n",
                        cap.id,
                        cap.auth_id,
                        cap.client_id,
                        cap.client_uuid,
                        cap.mode,
                        cap.remaining_secs(now)
                    );
                    if passes(&filter, &line) {
                        out.push_str(&line);
                    }
                }
            }
            DumpView::Inode => {
                for (inode, entries) in self.grouped() {
                    let hex = format!("{:016x}", inode);
                    if !passes(&filter, &hex) {
                        continue;
                    }
                    let _ = writeln!(out, "# i:{}", hex);
                    for (auth_id, cap) in &entries {
                        cap_line(&mut out, auth_id, cap.as_ref(), now);
                    }
                }
            }
            DumpView::Path => {
                // Resolution happens after the registry lock is released
                for (inode, entries) in self.grouped() {
                    let path = resolver
                        .and_then(|r| r.resolve(inode))
                        .unwrap_or_else(|| "<unknown>".to_string());
                    if !passes(&filter, &path) {
                        continue;
                    }
                    let _ = writeln!(out, "# {:<80}", path);
                    for (auth_id, cap) in &entries {
                        cap_line(&mut out, auth_id, cap.as_ref(), now);
                    }
                }
            }
        }

        Ok(out)
    }

    /// Snapshot of the inode index with the records it points to
    fn grouped(&self) -> Vec<(u64, Vec<(AuthId, Option<Capability>)>)> {
        let tables = self.read();
        tables
            .inodes()
            .map(|inode| {
                let entries = tables
                    .auth_ids_on(inode)
                    .map(|id| (id.clone(), tables.lookup(id).cloned()))
                    .collect();
                (inode, entries)
            })
            .collect()
    }
}
