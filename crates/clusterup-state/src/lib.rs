//! Run-state records for clusterup
//!
//! Defines the on-disk JSON record that tracks what happened to each host
//! for a named action (`<state_dir>/<action>.json`), and the store that
//! reads, atomically replaces and prunes those records.
//!
//! The field names and the host status enum are a wire contract shared with
//! status endpoints and the retry flow.

pub mod error;
pub mod lock;
pub mod record;
pub mod status;
pub mod store;

pub use error::StateError;
pub use lock::StateLock;
pub use record::{CommandRecord, HostEntry, RunStateRecord};
pub use status::HostStatus;
pub use store::StateStore;

/// File extension used for run-state files.
pub const STATE_FILE_EXTENSION: &str = "json";
