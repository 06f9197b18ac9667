//! Synchronization decision engine.
//!
//! - `classify`: compares SRC and DST listings by modification time
//! - `rotate`: moves superseded DST files into the backup tree and prunes history
//! - `mirror`: applies a classification to disk for one sync unit

pub mod classify;
pub mod mirror;
pub mod rotate;

use serde::{Deserialize, Serialize};

/// Progress of one sync unit through a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Validating,
    Seeding,
    Diffing,
    BackingUp,
    Mirroring,
    Pruning,
    Done,
}
