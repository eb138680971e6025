use thiserror::Error;

/// Errors raised while binding profiles into the scheduler.
///
/// Everything here is a configuration problem: the queue itself never fails,
/// and a profile with no upcoming occurrence is skipped rather than reported.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The time zone is not a known IANA zone name.
    #[error("Unknown time zone: {0}")]
    InvalidTimeZone(String),

    /// The profile record is structurally invalid (e.g. empty name).
    #[error("Invalid profile '{id}': {reason}")]
    InvalidProfile { id: String, reason: String },

    /// A second record with an id already present in the same configuration.
    #[error("Duplicate profile id: {id}")]
    DuplicateProfile { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
