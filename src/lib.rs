//! fusecap - capability leases and client cache authority
//!
//! Server side, a [`caps::CapRegistry`] grants time-bounded capabilities per
//! client and inode and fans out release/refresh/delete/metadata
//! notifications to the other holders. Client side, a
//! [`cache::CacheAuthority`] decides which client may buffer unflushed
//! writes for an inode and restores a file from its buffer when the close
//! fails.

pub mod cache;
pub mod caps;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod replay;
pub mod sweep;

pub use error::{FusecapError, FusecapResult};
