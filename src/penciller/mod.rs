//! The ledger penciller.
//!
//! The penciller maintains the ordered, leveled view of keys whose updates
//! have already been journaled upstream. Pushed batches stage in the L0
//! cache, convert into a level-zero SST when the cache saturates, and are
//! merged down through the levels by the clerk:
//!
//! ```text
//! bookie ──push──▶ L0 cache ──flush──▶ L0 file ──clerk──▶ L1 .. L7
//!                                 (reads walk the same path in reverse,
//!                                  first hit = highest SQN)
//! ```
//!
//! The server serializes every mutation; snapshots carry frozen clones so
//! range folds never block it.

pub mod cache;
pub(crate) mod clerk;
pub mod manifest;
pub mod reader;
pub mod server;
pub mod snapshot;

pub use server::{Penciller, PencillerStatus, PushResult};
pub use snapshot::{PencillerSnapshot, SnapshotMode};
