//! TaskStore port - external task の正本（source of truth）
//!
//! TaskStore は以下を提供します：
//! - 行の挿入・取得・条件検索
//! - 条件付き更新（lease の排他性はここで保証する）
//! - 管理用の一括削除
//!
//! # 実装
//! - `impls::InMemoryTaskStore`（テスト・組み込み用）
//! - `impls::SqliteTaskStore`（feature `sqlite`）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ids::TaskId;
use crate::domain::state::TaskState;
use crate::domain::task::lease_lapsed;

/// 保存されている 1 行
///
/// blob は書き込まれたテキストのまま保持します（解釈は ledger 側）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRow {
    pub id: TaskId,
    pub topic: String,
    pub correlation_id: String,
    pub process_model_id: String,
    pub process_instance_id: String,
    pub flow_node_instance_id: String,
    pub caller_context: Option<String>,
    pub payload: Option<String>,
    pub worker_id: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// find_all / delete_where の検索条件
///
/// 未指定のフィールドは条件に含めません。すべて AND で結合します。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub topic: Option<String>,
    pub state: Option<TaskState>,
    /// pending かつ lease が `at` の時点で切れている行のみ
    pub claimable_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub flow_node_instance_id: Option<String>,
    pub process_model_id: Option<String>,
}

impl TaskFilter {
    /// `topic` 上で `now` の時点で取得可能なタスク
    pub fn claimable(topic: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            topic: Some(topic.into()),
            claimable_at: Some(now),
            ..Self::default()
        }
    }

    pub fn instance_triple(
        correlation_id: impl Into<String>,
        process_instance_id: impl Into<String>,
        flow_node_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            process_instance_id: Some(process_instance_id.into()),
            flow_node_instance_id: Some(flow_node_instance_id.into()),
            ..Self::default()
        }
    }

    pub fn process_model(process_model_id: impl Into<String>) -> Self {
        Self {
            process_model_id: Some(process_model_id.into()),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    /// 行がこの条件を満たすか（in-memory 実装とテストで使用）
    pub fn matches(&self, row: &TaskRow) -> bool {
        fn eq(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().is_none_or(|e| e == actual)
        }

        eq(&self.topic, &row.topic)
            && self.state.is_none_or(|s| s == row.state)
            && self.claimable_at.is_none_or(|now| {
                row.state == TaskState::Pending && lease_lapsed(row.lock_expiration_time, now)
            })
            && eq(&self.correlation_id, &row.correlation_id)
            && eq(&self.process_instance_id, &row.process_instance_id)
            && eq(&self.flow_node_instance_id, &row.flow_node_instance_id)
            && eq(&self.process_model_id, &row.process_model_id)
    }
}

/// conditional_update のガード
///
/// ストアはガード評価とパッチ適用を 1 つの原子的操作として実行します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGuard {
    /// pending かつ lease なし（または期限切れ）
    Claimable { now: DateTime<Utc> },
    /// pending かつ（lease なし・期限切れ・`worker_id` 自身が保持）
    AccessibleBy {
        worker_id: String,
        now: DateTime<Utc>,
    },
}

impl LeaseGuard {
    pub fn holds(&self, row: &TaskRow) -> bool {
        if row.state != TaskState::Pending {
            return false;
        }
        match self {
            LeaseGuard::Claimable { now } => lease_lapsed(row.lock_expiration_time, *now),
            LeaseGuard::AccessibleBy { worker_id, now } => {
                lease_lapsed(row.lock_expiration_time, *now)
                    || row.worker_id.as_deref() == Some(worker_id.as_str())
            }
        }
    }
}

/// 行に適用する変更
///
/// `Some` のフィールドだけを上書きします。値を消す操作はありません
/// （finished 行の worker_id / lock_expiration_time は最後の値のまま残る）。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub worker_id: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub state: Option<TaskState>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn lease(worker_id: impl Into<String>, until: DateTime<Utc>) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            lock_expiration_time: Some(until),
            ..Self::default()
        }
    }

    pub fn finish_success(result: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            state: Some(TaskState::Finished),
            result: Some(result.into()),
            finished_at: Some(now),
            ..Self::default()
        }
    }

    pub fn finish_error(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            state: Some(TaskState::Finished),
            error: Some(error.into()),
            finished_at: Some(now),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, row: &mut TaskRow) {
        if let Some(worker_id) = &self.worker_id {
            row.worker_id = Some(worker_id.clone());
        }
        if let Some(until) = self.lock_expiration_time {
            row.lock_expiration_time = Some(until);
        }
        if let Some(state) = self.state {
            row.state = state;
        }
        if let Some(result) = &self.result {
            row.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            row.error = Some(error.clone());
        }
        if let Some(finished_at) = self.finished_at {
            row.finished_at = Some(finished_at);
        }
    }
}

/// StoreError は TaskStore の失敗
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task store backend error: {0}")]
    Backend(String),

    #[error("task store has been disposed")]
    Disposed,

    /// id / state カラムが解釈できない（blob の中身ではない）
    #[error("corrupt task row: {0}")]
    Corrupt(String),
}

/// TaskStore は external task の正本
///
/// # 設計原則
/// - lease の権威はここにある（conditional_update の原子性のみを前提とする）
/// - find_all は created_at の昇順（同時刻は id 順）で返す
/// - `Send + Sync` を要求（worker と orchestration から共有される）
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// スキーマの同期など。複数回呼んでもよい。
    async fn initialize(&self) -> Result<(), StoreError>;

    /// 接続を閉じる。以降の呼び出しは `StoreError::Disposed`。
    async fn dispose(&self) -> Result<(), StoreError>;

    async fn insert(&self, row: TaskRow) -> Result<TaskId, StoreError>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError>;

    async fn find_all(
        &self,
        filter: &TaskFilter,
        limit: Option<usize>,
    ) -> Result<Vec<TaskRow>, StoreError>;

    /// ガードが成り立つ場合のみパッチを適用する。適用したら `true`。
    async fn conditional_update(
        &self,
        id: TaskId,
        guard: &LeaseGuard,
        patch: &TaskPatch,
    ) -> Result<bool, StoreError>;

    /// 無条件の更新（競合しない管理用の書き込み）。行がなければ `false`。
    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, StoreError>;

    /// 条件に合う行をすべて削除し、件数を返す。lease は無視する。
    async fn delete_where(&self, filter: &TaskFilter) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn row(worker: Option<&str>, lock_offset_secs: Option<i64>, state: TaskState) -> TaskRow {
        TaskRow {
            id: TaskId::from_ulid(Ulid::new()),
            topic: "t1".into(),
            correlation_id: "c".into(),
            process_model_id: "m".into(),
            process_instance_id: "p".into(),
            flow_node_instance_id: "f".into(),
            caller_context: None,
            payload: Some("{}".into()),
            worker_id: worker.map(str::to_string),
            lock_expiration_time: lock_offset_secs.map(|s| t0() + Duration::seconds(s)),
            state,
            result: None,
            error: None,
            created_at: t0(),
            finished_at: None,
        }
    }

    #[rstest]
    #[case::unlocked(None, None, TaskState::Pending, true, true)]
    #[case::expired_other(Some("b"), Some(-5), TaskState::Pending, true, true)]
    #[case::live_self(Some("a"), Some(5), TaskState::Pending, false, true)]
    #[case::live_other(Some("b"), Some(5), TaskState::Pending, false, false)]
    #[case::finished_self(Some("a"), Some(5), TaskState::Finished, false, false)]
    fn guards(
        #[case] worker: Option<&str>,
        #[case] lock: Option<i64>,
        #[case] state: TaskState,
        #[case] claimable: bool,
        #[case] accessible_by_a: bool,
    ) {
        let r = row(worker, lock, state);

        assert_eq!(LeaseGuard::Claimable { now: t0() }.holds(&r), claimable);
        assert_eq!(
            LeaseGuard::AccessibleBy {
                worker_id: "a".into(),
                now: t0()
            }
            .holds(&r),
            accessible_by_a
        );
    }

    #[test]
    fn filter_combines_fields_with_and() {
        let r = row(None, None, TaskState::Pending);

        assert!(TaskFilter::default().matches(&r));
        assert!(TaskFilter::claimable("t1", t0()).matches(&r));
        assert!(!TaskFilter::claimable("t2", t0()).matches(&r));
        assert!(TaskFilter::instance_triple("c", "p", "f").matches(&r));
        assert!(!TaskFilter::instance_triple("c", "p", "other").matches(&r));
        assert!(!TaskFilter::process_model("m").with_state(TaskState::Finished).matches(&r));
    }

    #[test]
    fn finish_patch_keeps_lease_fields() {
        let mut r = row(Some("a"), Some(5), TaskState::Pending);
        TaskPatch::finish_success(r#"{"x":1}"#, t0()).apply(&mut r);

        assert_eq!(r.state, TaskState::Finished);
        assert_eq!(r.result.as_deref(), Some(r#"{"x":1}"#));
        assert_eq!(r.error, None);
        assert_eq!(r.finished_at, Some(t0()));
        assert_eq!(r.worker_id.as_deref(), Some("a"));
        assert!(r.lock_expiration_time.is_some());
        assert!(TaskPatch::default().is_empty());
    }
}
