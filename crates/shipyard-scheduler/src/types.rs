use std::fmt;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::types::JobId;

/// Bit set of behaviours attached to a queued job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPolicy(u8);

impl JobPolicy {
    pub const NONE: JobPolicy = JobPolicy(0);
    /// Replace the payload of a pending job with the same resource and message
    /// instead of queuing a new one.
    pub const MERGE: JobPolicy = JobPolicy(1);
    /// On failure, push the whole group back so the failed job stays first.
    pub const RETRY_PRESERVE_ORDER: JobPolicy = JobPolicy(1 << 1);
    /// The job may be deleted while it is not running.
    pub const CANCELLABLE: JobPolicy = JobPolicy(1 << 2);
    /// Only eligible once it is the last job referencing its resource.
    pub const WAIT_FOR_OTHERS_RESOURCE_ID: JobPolicy = JobPolicy(1 << 3);

    const NAMES: [(JobPolicy, &'static str); 4] = [
        (Self::MERGE, "merge"),
        (Self::RETRY_PRESERVE_ORDER, "retry_preserve_order"),
        (Self::CANCELLABLE, "cancellable"),
        (Self::WAIT_FOR_OTHERS_RESOURCE_ID, "wait_for_others_resource_id"),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        JobPolicy(bits & 0b1111)
    }

    pub const fn contains(self, other: JobPolicy) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for JobPolicy {
    type Output = JobPolicy;

    fn bitor(self, rhs: Self) -> Self::Output {
        JobPolicy(self.0 | rhs.0)
    }
}

impl fmt::Display for JobPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Caller-supplied knobs for [`crate::Scheduler::queue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Serialization key; falls back to the request's own group, then to the job id.
    pub group: Option<String>,
    pub policy: JobPolicy,
}

impl QueueOptions {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_policy(mut self, policy: JobPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Everything needed to persist a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub resource_id: String,
    pub message_name: String,
    /// JSON-encoded request.
    pub message_data: String,
    pub group: Option<String>,
    pub policy: JobPolicy,
}

/// Which message names a claim may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    All,
    Only(Vec<String>),
    Except(Vec<String>),
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub resource_id: String,
    pub group: String,
    pub message_name: String,
    pub message_data: String,
    pub queued_at: DateTime<Utc>,
    /// Earliest instant at which the job may be claimed.
    pub not_before: DateTime<Utc>,
    /// Last failure; `None` when the job never failed or its error was cleared.
    pub error_code: Option<String>,
    pub policy: JobPolicy,
    /// Claimed by a worker and not yet settled.
    pub retrieved: bool,
}
