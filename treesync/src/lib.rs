//! treesync Library
//!
//! One-way directory synchronization with rotating backup versions of every
//! file the mirror overwrites or deletes.

pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod fs;
pub mod job;
pub mod sync;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use events::{EventSink, SyncEvent};
pub use executor::context::RunContext;
pub use executor::report::SyncReport;
pub use executor::SyncExecutor;
pub use job::{Retention, SyncJob, SyncMode, SyncTarget, VersioningStrategy};
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
