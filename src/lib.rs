pub mod codec;
pub mod config;
pub mod error;
pub mod penciller;
pub mod sst;
pub mod tmpfs;

pub use codec::{Key, KeyHash, Status, Value};
pub use config::PencillerConfig;
pub use error::{Error, Result};
pub use penciller::{Penciller, PencillerSnapshot, PencillerStatus, PushResult, SnapshotMode};
