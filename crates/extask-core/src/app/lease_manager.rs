//! LeaseManager - 取得・lease 延長・完了
//!
//! # 排他性
//! - 取得は行ごとに 1 回の条件付き更新（`LeaseGuard::Claimable`）
//! - 延長・完了は `LeaseGuard::AccessibleBy` で、判定と書き込みが同じ原子操作
//! - ガードに負けたら最新の行を読み直して NotFound / Gone / Locked に分類する
//!
//! lease は受動的に切れるだけで、回収処理はありません（at-least-once）。

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::{debug, info, warn};

use crate::domain::blob::Blob;
use crate::domain::errors::LeaseError;
use crate::domain::failure::TaskFailure;
use crate::domain::ids::TaskId;
use crate::domain::state::TaskState;
use crate::domain::task::{ExternalTask, lease_lapsed};
use crate::ports::{Clock, LeaseGuard, StoreError, TaskFilter, TaskPatch, TaskRow, TaskStore};

use super::ledger::TaskLedger;

/// ガードに負けたあと読み直して再試行する回数の上限
const MAX_GUARDED_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct LeaseManager {
    ledger: TaskLedger,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    default_lock_duration: Duration,
}

impl LeaseManager {
    pub fn new(
        ledger: TaskLedger,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        default_lock_duration: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            clock,
            default_lock_duration,
        }
    }

    /// 呼び出し側が lock duration を決めていないときに使う期間
    pub fn default_lock_duration(&self) -> Duration {
        self.default_lock_duration
    }

    /// `topic` 上の取得可能なタスクを最大 `max_tasks` 件（0 以下なら無制限）lease する
    ///
    /// 競合に負けた行は結果に含めず、次のポーリングで再び見えます。
    pub async fn fetch_and_lock(
        &self,
        worker_id: &str,
        topic: &str,
        max_tasks: i64,
        lock_duration: Duration,
    ) -> Result<Vec<ExternalTask>, LeaseError> {
        require_worker(worker_id)?;
        require_positive("lock duration", lock_duration)?;

        let now = self.clock.now_ms();
        let lock_until = lease_until(now, lock_duration)?;
        let limit = (max_tasks > 0).then_some(max_tasks as usize);
        let candidates = self
            .store
            .find_all(&TaskFilter::claimable(topic, now), limit)
            .await?;

        let guard = LeaseGuard::Claimable { now };
        let patch = TaskPatch::lease(worker_id, lock_until);
        let mut locked = Vec::with_capacity(candidates.len());
        for mut row in candidates {
            if self.store.conditional_update(row.id, &guard, &patch).await? {
                patch.apply(&mut row);
                locked.push(TaskLedger::to_task(row));
            } else {
                debug!(task_id = %row.id, worker_id, "lost claim race");
            }
        }

        if !locked.is_empty() {
            info!(worker_id, topic, count = locked.len(), "locked external tasks");
        }
        Ok(locked)
    }

    /// lease を `now + additional_duration` に置き換える（以前の期限は見ない）
    pub async fn extend_lease(
        &self,
        worker_id: &str,
        task_id: TaskId,
        additional_duration: Duration,
    ) -> Result<(), LeaseError> {
        require_worker(worker_id)?;
        require_positive("additional duration", additional_duration)?;

        self.mutate_guarded(worker_id, task_id, |now| {
            Ok(TaskPatch::lease(worker_id, lease_until(now, additional_duration)?))
        })
        .await?;
        debug!(%task_id, worker_id, additional_ms = additional_duration.num_milliseconds(), "lease extended");
        Ok(())
    }

    pub async fn finish_with_success(
        &self,
        worker_id: &str,
        task_id: TaskId,
        result: Blob,
    ) -> Result<(), LeaseError> {
        require_worker(worker_id)?;
        let result = result.into_inner();
        self.mutate_guarded(worker_id, task_id, |now| {
            Ok(TaskPatch::finish_success(result.clone(), now))
        })
        .await?;
        info!(%task_id, worker_id, "external task finished");
        Ok(())
    }

    pub async fn finish_with_error(
        &self,
        worker_id: &str,
        task_id: TaskId,
        error: Blob,
    ) -> Result<(), LeaseError> {
        require_worker(worker_id)?;
        let error = error.into_inner();
        self.mutate_guarded(worker_id, task_id, |now| {
            Ok(TaskPatch::finish_error(error.clone(), now))
        })
        .await?;
        info!(%task_id, worker_id, "external task finished with error");
        Ok(())
    }

    /// BPMN エラー（モデル側で定義されたエラーコード）で完了する
    pub async fn handle_bpmn_error(
        &self,
        worker_id: &str,
        task_id: TaskId,
        error_code: &str,
    ) -> Result<(), LeaseError> {
        let failure = TaskFailure::bpmn(error_code);
        self.finish_with_failure(worker_id, task_id, failure).await
    }

    /// worker 自身のサービス呼び出しの失敗で完了する
    pub async fn handle_service_error(
        &self,
        worker_id: &str,
        task_id: TaskId,
        message: &str,
        details: &str,
    ) -> Result<(), LeaseError> {
        let failure = TaskFailure::service(message, details);
        self.finish_with_failure(worker_id, task_id, failure).await
    }

    async fn finish_with_failure(
        &self,
        worker_id: &str,
        task_id: TaskId,
        failure: TaskFailure,
    ) -> Result<(), LeaseError> {
        let blob = failure
            .to_blob()
            .map_err(|e| LeaseError::Validation(format!("failed to encode failure: {e}")))?;
        warn!(%task_id, worker_id, kind = ?failure.kind, message = %failure.message, "external task failed");
        self.finish_with_error(worker_id, task_id, blob).await
    }

    /// `worker_id` が `row` を操作してよいか判定する
    ///
    /// 1. 行がある（なければ NotFound）
    /// 2. finished ではない（なら Gone）
    /// 3. 別の worker の lease が生きていない（なら Locked）
    pub fn ensure_accessible(
        task_id: TaskId,
        worker_id: &str,
        row: Option<&TaskRow>,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let row = row.ok_or_else(|| LeaseError::task_not_found(task_id))?;
        if row.state == TaskState::Finished {
            return Err(LeaseError::Gone { task_id });
        }
        let held_by_caller = row.worker_id.as_deref() == Some(worker_id);
        match row.lock_expiration_time {
            Some(until) if !held_by_caller && !lease_lapsed(Some(until), now) => {
                Err(LeaseError::Locked { task_id, until })
            }
            _ => Ok(()),
        }
    }

    /// 最新の行で判定してから、同じ条件をガードにして書き込む
    async fn mutate_guarded<F>(
        &self,
        worker_id: &str,
        task_id: TaskId,
        patch_at: F,
    ) -> Result<(), LeaseError>
    where
        F: Fn(DateTime<Utc>) -> Result<TaskPatch, LeaseError>,
    {
        for _ in 0..MAX_GUARDED_ATTEMPTS {
            let now = self.clock.now_ms();
            let row = self.ledger.load_row(task_id).await?;
            Self::ensure_accessible(task_id, worker_id, row.as_ref(), now)?;
            let patch = patch_at(now)?;

            let guard = LeaseGuard::AccessibleBy {
                worker_id: worker_id.to_string(),
                now,
            };
            if self
                .store
                .conditional_update(task_id, &guard, &patch)
                .await?
            {
                return Ok(());
            }
            debug!(%task_id, worker_id, "guarded update lost a race, re-reading");
        }

        // 読み直しでは許可されるのに書き込みが毎回負ける場合
        let now = self.clock.now_ms();
        let row = self.ledger.load_row(task_id).await?;
        Self::ensure_accessible(task_id, worker_id, row.as_ref(), now)?;
        Err(LeaseError::Store(StoreError::Backend(format!(
            "conditional update on {task_id} kept losing after {MAX_GUARDED_ATTEMPTS} attempts"
        ))))
    }
}

fn require_worker(worker_id: &str) -> Result<(), LeaseError> {
    if worker_id.trim().is_empty() {
        return Err(LeaseError::Validation("worker id must not be empty".into()));
    }
    Ok(())
}

/// `now + duration`。ストアはミリ秒で保存するので、期限もミリ秒に切り捨てる
fn lease_until(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, LeaseError> {
    now.checked_add_signed(duration)
        .map(|until| until.trunc_subsecs(3))
        .ok_or_else(|| LeaseError::Validation("lock duration out of range".into()))
}

fn require_positive(what: &str, duration: Duration) -> Result<(), LeaseError> {
    if duration <= Duration::zero() {
        return Err(LeaseError::Validation(format!(
            "{what} must be positive, got {}ms",
            duration.num_milliseconds()
        )));
    }
    Ok(())
}
