//! Activity log for the berth control plane.
//!
//! Every security- or deployment-relevant event (registration, deploys,
//! proxy changes, command failures) is recorded as an [`ActivityEntry`] in
//! a per-owner bounded in-memory ring and broadcast so the router can push
//! an `AUDIT_UPDATE` to the owner's dashboards. Entries are never mutated
//! after creation; a correction is a new entry. Durable storage is the
//! repository collaborator's concern.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod entry;
mod log;

pub use entry::{ActivityEntry, ActivityKind};
pub use log::{ActivityLog, DEFAULT_RING_CAPACITY};
