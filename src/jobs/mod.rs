//! Job Manager
//!
//! Submissions are validated by `JobManager`, queued in priority order and
//! admitted against a fixed slot budget by a single scheduler task.

pub mod job;
pub mod manager;
pub mod queue;
pub mod scheduler;
pub mod slots;

pub use job::{
    Job, JobError, JobFilter, JobId, JobInfo, JobKind, JobPayload, JobRequest, JobState,
    DEFAULT_ESTIMATED_SLOTS, DEFAULT_PRIORITY, HIGHEST_PRIORITY, LOWEST_PRIORITY,
};
pub use manager::JobManager;
pub use queue::AdmissionQueue;
pub use scheduler::SchedulerStats;
pub use slots::SlotPool;
