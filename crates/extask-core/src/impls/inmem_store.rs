//! InMemoryTaskStore - テスト・組み込み用の正本
//!
//! # 実装詳細
//! - HashMap<TaskId, TaskRow> を tokio::sync::Mutex で保護
//! - ガード評価とパッチ適用は同じクリティカルセクション内（CAS と同等）
//! - dispose 後はすべての呼び出しが `StoreError::Disposed`

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::ids::TaskId;
use crate::ports::{LeaseGuard, StoreError, TaskFilter, TaskPatch, TaskRow, TaskStore};

#[derive(Default)]
struct State {
    rows: HashMap<TaskId, TaskRow>,
    disposed: bool,
}

impl State {
    fn live(&mut self) -> Result<&mut HashMap<TaskId, TaskRow>, StoreError> {
        if self.disposed {
            return Err(StoreError::Disposed);
        }
        Ok(&mut self.rows)
    }
}

/// InMemoryTaskStore はプロセス内のみで共有される TaskStore
///
/// # 使用例
/// ```ignore
/// let store = Arc::new(InMemoryTaskStore::new());
/// let engine = EngineBuilder::new().store(store).build()?;
/// ```
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_rows(rows: &mut [TaskRow]) {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.state.lock().await.live().map(|_| ())
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.disposed = true;
        state.rows.clear();
        Ok(())
    }

    async fn insert(&self, row: TaskRow) -> Result<TaskId, StoreError> {
        let mut state = self.state.lock().await;
        let rows = state.live()?;
        if rows.contains_key(&row.id) {
            return Err(StoreError::Backend(format!("duplicate task id {}", row.id)));
        }
        let id = row.id;
        rows.insert(id, row);
        Ok(id)
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.live()?.get(&id).cloned())
    }

    async fn find_all(
        &self,
        filter: &TaskFilter,
        limit: Option<usize>,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let mut state = self.state.lock().await;
        let mut matched: Vec<TaskRow> = state
            .live()?
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        sort_rows(&mut matched);
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn conditional_update(
        &self,
        id: TaskId,
        guard: &LeaseGuard,
        patch: &TaskPatch,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.live()?.get_mut(&id) else {
            return Ok(false);
        };
        if !guard.holds(row) {
            return Ok(false);
        }
        patch.apply(row);
        Ok(true)
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.live()?.get_mut(&id) {
            Some(row) => {
                patch.apply(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_where(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let rows = state.live()?;
        let before = rows.len();
        rows.retain(|_, row| !filter.matches(row));
        Ok((before - rows.len()) as u64)
    }
}
