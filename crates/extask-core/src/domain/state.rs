//! State - external task の状態
//!
//! # 状態遷移
//! - pending → finished（一方向のみ）
//!
//! lease（worker_id + lock_expiration_time）は状態ではなく、pending 中の属性です。
//! lease の有無は時刻に依存するため、enum には含めません。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// TaskState はタスクの状態を表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Finished,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished)
    }

    /// Text form used by the Task Store columns.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Finished => "finished",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "finished" => Ok(TaskState::Finished),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::pending(TaskState::Pending, "pending", false)]
    #[case::finished(TaskState::Finished, "finished", true)]
    fn text_form_round_trips(
        #[case] state: TaskState,
        #[case] text: &str,
        #[case] terminal: bool,
    ) {
        assert_eq!(state.as_str(), text);
        assert_eq!(text.parse::<TaskState>().unwrap(), state);
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn unknown_state_is_rejected() {
        assert!("running".parse::<TaskState>().is_err());
    }
}
