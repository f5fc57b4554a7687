//! `vigil-memory` – The Recovery Store.
//!
//! Durable on-disk state for the supervision core: crash-safe file
//! replacement, point-in-time backups and the append-only escalation log.
//!
//! # Modules
//!
//! - [`atomic`] – temp-file + `fsync` + rename writes, so readers never see a
//!   half-written record.
//! - [`snapshot`] – [`SnapshotService`][snapshot::SnapshotService]: best-effort
//!   copies of configured paths with an immutable manifest, verification,
//!   listing, restore and retention.
//! - [`freeze_log`] – [`FreezeLog`][freeze_log::FreezeLog]: JSON-Lines record of
//!   every watchdog escalation.

pub mod atomic;
pub mod freeze_log;
pub mod snapshot;

pub use freeze_log::{FreezeEvent, FreezeLog};
pub use snapshot::{
    SnapshotError, SnapshotManifest, SnapshotOutcome, SnapshotRequest, SnapshotService,
    SnapshotVerification,
};
