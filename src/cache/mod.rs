//! Client-side cache authority
//!
//! Governs which client may buffer unflushed writes for an inode and how a
//! writer recovers when its close fails.
//!
//! # Entry States
//!
//! | State | lifetime | Create | Reuse |
//! |-------|----------|--------|-------|
//! | Owned | 0 | refused | miss |
//! | Leased | now < lifetime | refused | shared buffer + size |
//! | Expired | lifetime <= now | fresh entry | miss |
//!
//! An owned entry turns leased when its writer closes. Expired entries are
//! swept on the next acquisition after the sweep interval.

pub mod authority;
pub mod buffer;
pub mod cgi;
pub mod file;
pub mod restore;

pub use authority::{CacheAuthority, CacheEntryInfo, CacheHandle, CacheWrite, SharedBuffer};
pub use buffer::CacheBuffer;
pub use file::{CachedFile, FileStat, LayoutFile, OpenFlags};
pub use restore::{ReplicaIo, RestoreTarget};
