//! External task model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::blob::Blob;
use super::failure::ErrorPayload;
use super::ids::TaskId;
use super::state::TaskState;

/// Identifies the workflow position that created a task.
///
/// Callers must keep this unique per active task; lookups by triple assume it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceTriple {
    pub correlation_id: String,
    pub process_instance_id: String,
    pub flow_node_instance_id: String,
}

impl InstanceTriple {
    pub fn new(
        correlation_id: impl Into<String>,
        process_instance_id: impl Into<String>,
        flow_node_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            process_instance_id: process_instance_id.into(),
            flow_node_instance_id: flow_node_instance_id.into(),
        }
    }
}

/// Input for task creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExternalTask {
    pub topic: String,
    pub correlation_id: String,
    pub process_model_id: String,
    pub process_instance_id: String,
    pub flow_node_instance_id: String,
    #[serde(default)]
    pub caller_context: Blob,
    #[serde(default)]
    pub payload: Blob,
}

/// One unit of externally executed work, as handed to workers and orchestration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalTask {
    pub id: TaskId,
    pub topic: String,
    pub correlation_id: String,
    pub process_model_id: String,
    pub process_instance_id: String,
    pub flow_node_instance_id: String,
    pub caller_context: Blob,
    pub payload: Blob,

    /// Current lease holder.
    pub worker_id: Option<String>,
    /// End of the current lease. Unset or in the past means claimable.
    pub lock_expiration_time: Option<DateTime<Utc>>,

    pub state: TaskState,
    pub result: Option<Blob>,
    pub error: Option<ErrorPayload>,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExternalTask {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Pending and not covered by a live lease.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && lease_lapsed(self.lock_expiration_time, now)
    }

    /// Pending and covered by a live lease.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && !lease_lapsed(self.lock_expiration_time, now)
    }
}

/// A lease is lapsed when it was never taken or its expiration is strictly past.
pub fn lease_lapsed(lock_expiration_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match lock_expiration_time {
        None => true,
        Some(expires_at) => expires_at < now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn sample(state: TaskState, lock: Option<DateTime<Utc>>) -> ExternalTask {
        ExternalTask {
            id: TaskId::from_ulid(Ulid::new()),
            topic: "t1".into(),
            correlation_id: "c".into(),
            process_model_id: "m".into(),
            process_instance_id: "p".into(),
            flow_node_instance_id: "f".into(),
            caller_context: Blob::default(),
            payload: Blob::default(),
            worker_id: lock.map(|_| "w".to_string()),
            lock_expiration_time: lock,
            state,
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    #[rstest]
    #[case::never_locked(TaskState::Pending, None, true)]
    #[case::expired(TaskState::Pending, Some(-1), true)]
    #[case::expires_now(TaskState::Pending, Some(0), false)]
    #[case::live(TaskState::Pending, Some(30), false)]
    #[case::finished(TaskState::Finished, None, false)]
    fn availability(
        #[case] state: TaskState,
        #[case] lock_offset_secs: Option<i64>,
        #[case] available: bool,
    ) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let lock = lock_offset_secs.map(|s| now + Duration::seconds(s));
        let task = sample(state, lock);

        assert_eq!(task.is_available(now), available);
        if state == TaskState::Pending {
            assert_eq!(task.is_leased(now), !available);
        } else {
            assert!(!task.is_leased(now));
        }
    }
}
