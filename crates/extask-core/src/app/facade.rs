//! TaskFacade - orchestration 側の作成・参照の窓口
//!
//! 入力検証だけを行い、あとは TaskLedger に委譲します。
//! lease を無視する管理用の一括削除もここに置きます。

use std::sync::Arc;

use tracing::warn;

use crate::domain::errors::LeaseError;
use crate::domain::ids::TaskId;
use crate::domain::task::{ExternalTask, InstanceTriple, NewExternalTask};
use crate::ports::{TaskFilter, TaskStore};

use super::ledger::TaskLedger;

#[derive(Clone)]
pub struct TaskFacade {
    ledger: TaskLedger,
    store: Arc<dyn TaskStore>,
}

impl TaskFacade {
    pub fn new(ledger: TaskLedger, store: Arc<dyn TaskStore>) -> Self {
        Self { ledger, store }
    }

    pub async fn create(&self, new: NewExternalTask) -> Result<TaskId, LeaseError> {
        require_non_empty("topic", &new.topic)?;
        require_non_empty("correlation id", &new.correlation_id)?;
        require_non_empty("process model id", &new.process_model_id)?;
        require_non_empty("process instance id", &new.process_instance_id)?;
        require_non_empty("flow node instance id", &new.flow_node_instance_id)?;
        self.ledger.create(new).await
    }

    pub async fn get_by_id(&self, id: TaskId) -> Result<ExternalTask, LeaseError> {
        self.ledger.get_by_id(id).await
    }

    pub async fn get_by_instance_triple(
        &self,
        correlation_id: &str,
        process_instance_id: &str,
        flow_node_instance_id: &str,
    ) -> Result<ExternalTask, LeaseError> {
        let triple = InstanceTriple::new(correlation_id, process_instance_id, flow_node_instance_id);
        self.ledger.get_by_instance_triple(&triple).await
    }

    /// プロセスモデルに属するタスクを状態・lease に関係なくすべて削除する
    pub async fn delete_by_process_model_id(&self, process_model_id: &str) -> Result<u64, LeaseError> {
        require_non_empty("process model id", process_model_id)?;
        let deleted = self
            .store
            .delete_where(&TaskFilter::process_model(process_model_id))
            .await?;
        warn!(process_model_id, deleted, "deleted external tasks by process model");
        Ok(deleted)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), LeaseError> {
    if value.trim().is_empty() {
        return Err(LeaseError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::blob::Blob;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{Clock, SystemClock, UlidGenerator};
    use rstest::rstest;

    fn facade() -> TaskFacade {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        TaskFacade::new(TaskLedger::new(store.clone(), clock, ids), store)
    }

    fn new_task(model: &str, flow_node: &str) -> NewExternalTask {
        NewExternalTask {
            topic: "t1".into(),
            correlation_id: "c".into(),
            process_model_id: model.into(),
            process_instance_id: "p".into(),
            flow_node_instance_id: flow_node.into(),
            caller_context: Blob::default(),
            payload: Blob::new("{}"),
        }
    }

    #[rstest]
    #[case::topic(|t: &mut NewExternalTask| t.topic.clear())]
    #[case::correlation(|t: &mut NewExternalTask| t.correlation_id = "  ".into())]
    #[case::flow_node(|t: &mut NewExternalTask| t.flow_node_instance_id.clear())]
    #[tokio::test]
    async fn create_rejects_blank_identifiers(#[case] blank: fn(&mut NewExternalTask)) {
        let facade = facade();
        let mut task = new_task("m", "f");
        blank(&mut task);

        let err = facade.create(task).await.unwrap_err();
        assert!(matches!(err, LeaseError::Validation(_)));
    }

    #[tokio::test]
    async fn lookup_by_triple_goes_through_ledger() {
        let facade = facade();
        let id = facade.create(new_task("m", "f")).await.unwrap();

        let task = facade.get_by_instance_triple("c", "p", "f").await.unwrap();
        assert_eq!(task.id, id);
        assert_eq!(facade.get_by_id(id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn delete_by_process_model_only_touches_that_model() {
        let facade = facade();
        let gone = facade.create(new_task("m1", "f1")).await.unwrap();
        let kept = facade.create(new_task("m2", "f2")).await.unwrap();

        assert_eq!(facade.delete_by_process_model_id("m1").await.unwrap(), 1);
        assert!(matches!(
            facade.get_by_id(gone).await,
            Err(LeaseError::NotFound(_))
        ));
        assert!(facade.get_by_id(kept).await.is_ok());
        assert_eq!(facade.delete_by_process_model_id("m1").await.unwrap(), 0);
    }
}
