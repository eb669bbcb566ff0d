//! Errors - 呼び出し側に返すエラー分類
//!
//! worker が「リトライ」「スキップ」「アラート」を判断できるように、
//! NotFound / Gone / Locked を別々の variant として区別します。

use chrono::{DateTime, Utc};

use crate::ports::StoreError;

use super::ids::TaskId;

/// LeaseError は core の全操作が返すエラー
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Referenced task id or instance triple does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Task exists but is already finished.
    #[error("external task {task_id} has been finished and is no longer accessible")]
    Gone { task_id: TaskId },

    /// Task is pending and leased by another worker.
    #[error("external task {task_id} is locked by another worker until {}", .until.to_rfc3339())]
    Locked {
        task_id: TaskId,
        until: DateTime<Utc>,
    },

    /// Malformed caller input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    pub fn task_not_found(task_id: TaskId) -> Self {
        Self::NotFound(format!("external task {task_id}"))
    }

    /// Lease expiration to back off until, for `Locked`.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Locked { until, .. } => Some(*until),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    #[test]
    fn locked_names_the_expiration() {
        let until = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();
        let err = LeaseError::Locked {
            task_id: TaskId::from_ulid(Ulid::new()),
            until,
        };

        assert!(err.to_string().contains("2024-01-01T12:00:30"));
        assert_eq!(err.retry_after(), Some(until));
    }

    #[test]
    fn not_found_mentions_the_task() {
        let id = TaskId::from_ulid(Ulid::new());
        let err = LeaseError::task_not_found(id);

        assert_eq!(err.to_string(), format!("external task {id} not found"));
        assert!(err.retry_after().is_none());
    }
}
