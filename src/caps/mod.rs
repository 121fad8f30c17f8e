//! Server-side capability registry
//!
//! Capabilities are time-bounded grants of one client session over one
//! inode. The registry stores them, derives implied grants for children,
//! and fans out release/refresh/delete/metadata notifications to the other
//! holders when an entry changes.
//!
//! # Capability lifecycle
//!
//! | State | Description |
//! |-------|-------------|
//! | Issued | Stored by `store`, `imply` or `issue` |
//! | Active | `vtime == 0` or `vtime > now` |
//! | Expired | Lease passed, removed by the next sweep |
//! | Removed | Swept, or dropped by `delete(inode)` |

pub mod broadcast;
pub mod capability;
pub mod dump;
pub mod grant;
pub mod lease;
pub mod registry;

pub use broadcast::{BroadcastReport, BroadcastTransport, Metadata, Notification, RecordingTransport};
pub use capability::{AuthId, Capability, Identity};
pub use dump::{DumpView, PathResolver};
pub use grant::CapRequest;
pub use lease::{LeaseSource, LeaseTable, DEFAULT_LEASE_SECS};
pub use registry::CapRegistry;
