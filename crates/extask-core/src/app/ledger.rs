//! TaskLedger - 行と ExternalTask の対応付け
//!
//! - 作成（id と created_at を付与して pending 行を挿入）
//! - id / instance triple による取得
//! - 保存された blob の解釈（読み出しは blob の中身で失敗しない）

use std::sync::Arc;

use tracing::debug;

use crate::domain::blob::Blob;
use crate::domain::errors::LeaseError;
use crate::domain::failure::ErrorPayload;
use crate::domain::ids::TaskId;
use crate::domain::state::TaskState;
use crate::domain::task::{ExternalTask, InstanceTriple, NewExternalTask};
use crate::ports::{Clock, IdGenerator, TaskFilter, TaskRow, TaskStore};

#[derive(Clone)]
pub struct TaskLedger {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskLedger {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    /// pending・lease なしの行を挿入する
    pub async fn create(&self, new: NewExternalTask) -> Result<TaskId, LeaseError> {
        let row = TaskRow {
            id: self.ids.generate_task_id(),
            topic: new.topic,
            correlation_id: new.correlation_id,
            process_model_id: new.process_model_id,
            process_instance_id: new.process_instance_id,
            flow_node_instance_id: new.flow_node_instance_id,
            caller_context: Some(new.caller_context.into_inner()),
            payload: Some(new.payload.into_inner()),
            worker_id: None,
            lock_expiration_time: None,
            state: TaskState::Pending,
            result: None,
            error: None,
            created_at: self.clock.now_ms(),
            finished_at: None,
        };
        let id = self.store.insert(row).await?;
        debug!(task_id = %id, "external task created");
        Ok(id)
    }

    pub async fn get_by_id(&self, id: TaskId) -> Result<ExternalTask, LeaseError> {
        self.load_row(id)
            .await?
            .map(Self::to_task)
            .ok_or_else(|| LeaseError::task_not_found(id))
    }

    /// triple は active なタスクごとに一意である前提。複数あれば最古の 1 件を返す。
    pub async fn get_by_instance_triple(
        &self,
        triple: &InstanceTriple,
    ) -> Result<ExternalTask, LeaseError> {
        let filter = TaskFilter::instance_triple(
            triple.correlation_id.clone(),
            triple.process_instance_id.clone(),
            triple.flow_node_instance_id.clone(),
        );
        let mut rows = self.store.find_all(&filter, Some(1)).await?;
        if rows.is_empty() {
            return Err(LeaseError::NotFound(format!(
                "external task for correlation {} / process instance {} / flow node instance {}",
                triple.correlation_id, triple.process_instance_id, triple.flow_node_instance_id
            )));
        }
        Ok(Self::to_task(rows.swap_remove(0)))
    }

    /// 最新の行を読む（lease 判定の直前に使う）
    pub async fn load_row(&self, id: TaskId) -> Result<Option<TaskRow>, LeaseError> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub fn to_task(row: TaskRow) -> ExternalTask {
        ExternalTask {
            id: row.id,
            topic: row.topic,
            correlation_id: row.correlation_id,
            process_model_id: row.process_model_id,
            process_instance_id: row.process_instance_id,
            flow_node_instance_id: row.flow_node_instance_id,
            caller_context: row.caller_context.map(Blob::from).unwrap_or_default(),
            payload: row.payload.map(Blob::from).unwrap_or_default(),
            worker_id: row.worker_id,
            lock_expiration_time: row.lock_expiration_time,
            state: row.state,
            result: row.result.map(Blob::from),
            error: row.error.as_deref().map(ErrorPayload::decode),
            created_at: row.created_at,
            finished_at: row.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{FixedClock, TaskPatch, UlidGenerator};
    use chrono::{TimeZone, Utc};

    fn ledger() -> (Arc<InMemoryTaskStore>, TaskLedger) {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        (store.clone(), TaskLedger::new(store, clock, ids))
    }

    fn new_task(flow_node: &str) -> NewExternalTask {
        NewExternalTask {
            topic: "t1".into(),
            correlation_id: "c".into(),
            process_model_id: "m".into(),
            process_instance_id: "p".into(),
            flow_node_instance_id: flow_node.into(),
            caller_context: Blob::new(r#"{"sub":"user-1"}"#),
            payload: Blob::new(r#"{"order":7}"#),
        }
    }

    #[tokio::test]
    async fn created_task_is_pending_without_lease() {
        let (_, ledger) = ledger();
        let id = ledger.create(new_task("f")).await.unwrap();

        let task = ledger.get_by_id(id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.worker_id.is_none());
        assert!(task.lock_expiration_time.is_none());
        assert!(task.finished_at.is_none());
        assert_eq!(task.payload.as_str(), r#"{"order":7}"#);
        assert_eq!(task.caller_context.as_str(), r#"{"sub":"user-1"}"#);
        assert_eq!(task.created_at, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn lookup_by_instance_triple() {
        let (_, ledger) = ledger();
        ledger.create(new_task("f1")).await.unwrap();
        let id = ledger.create(new_task("f2")).await.unwrap();

        let task = ledger
            .get_by_instance_triple(&InstanceTriple::new("c", "p", "f2"))
            .await
            .unwrap();
        assert_eq!(task.id, id);

        let err = ledger
            .get_by_instance_triple(&InstanceTriple::new("c", "p", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (_, ledger) = ledger();
        let id = TaskId::from_ulid(ulid::Ulid::new());

        let err = ledger.get_by_id(id).await.unwrap_err();
        assert!(matches!(err, LeaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn malformed_error_blob_still_reads() {
        let (store, ledger) = ledger();
        let id = ledger.create(new_task("f")).await.unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 1).unwrap();
        store
            .update(id, &TaskPatch::finish_error("{not json", now))
            .await
            .unwrap();

        let task = ledger.get_by_id(id).await.unwrap();
        assert_eq!(task.error, Some(ErrorPayload::Raw("{not json".into())));
        assert!(task.is_finished());
    }
}
