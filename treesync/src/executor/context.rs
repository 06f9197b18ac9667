//! Per-invocation run identity.
//!
//! Every pass gets one timestamp and one user name, fixed when the run starts
//! and passed explicitly to whatever names backup versions.

use chrono::{Local, NaiveDateTime, Timelike};

/// Timestamp layout used in backup names; sorts lexicographically by time
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Length of a formatted timestamp, e.g. `2024-03-01_101500`
pub const TIMESTAMP_LEN: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    started: NaiveDateTime,
    user: String,
}

impl RunContext {
    /// Context for a run starting now, as the invoking user
    pub fn start() -> Self {
        Self::new(Local::now().naive_local(), current_user())
    }

    pub fn new(started: NaiveDateTime, user: impl AsRef<str>) -> Self {
        Self {
            // Sub-second precision never reaches a name
            started: started.with_nanosecond(0).unwrap_or(started),
            user: sanitize_user(user.as_ref()),
        }
    }

    /// `2024-03-01_101500`
    pub fn timestamp(&self) -> String {
        self.started.format(TIMESTAMP_FORMAT).to_string()
    }

    /// `2024-03-01_101500_alice`, the per-run backup folder name
    pub fn tag(&self) -> String {
        format!("{}_{}", self.timestamp(), self.user)
    }
}

/// Parse a timestamp written with [`TIMESTAMP_FORMAT`]
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    if value.len() != TIMESTAMP_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()
}

/// Name of the user running this process
pub fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn sanitize_user(user: &str) -> String {
    let cleaned: String = user
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
