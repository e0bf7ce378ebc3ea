//! `shipyard-scheduler` — durable async job queue on SQLite plus the worker
//! pool that drains it through the bus.
//!
//! # Overview
//!
//! [`Scheduler::queue`] persists an async request as a row of the
//! `scheduled_jobs` table. The [`WorkerPool`] claims rows, decodes them by
//! message name and runs the bound handler. A job belongs to exactly one
//! group and groups are strictly serial: no job of a group is claimed while
//! another job of that group is running.
//!
//! # Policies
//!
//! | Policy                        | Effect                                               |
//! |-------------------------------|------------------------------------------------------|
//! | `MERGE`                       | Replace the payload of a pending job (same resource + message) |
//! | `RETRY_PRESERVE_ORDER`        | A failure pushes back the whole group, failed job first |
//! | `CANCELLABLE`                 | May be deleted while not running                     |
//! | `WAIT_FOR_OTHERS_RESOURCE_ID` | Eligible only once no other job references the resource |
//!
//! # Outcomes
//!
//! `Processed` deletes the job, `Delay` reschedules it without an error, and
//! a handler error or panic reschedules it with the error recorded.

pub mod db;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod types;

pub use error::{Result, SchedulerError};
pub use pool::WorkerPool;
pub use scheduler::{DismissJob, GetJobs, JobDismissed, RetryJob, Scheduler};
pub use store::{JobStore, JOBS_PER_PAGE, RETRY_DELAY_SECS};
pub use types::{Job, JobPolicy, MessageFilter, NewJob, QueueOptions};
