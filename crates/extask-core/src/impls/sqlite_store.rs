//! SqliteTaskStore - SQLite を正本にする TaskStore
//!
//! # 実装詳細
//! - `Arc<std::sync::Mutex<Option<Connection>>>` を spawn_blocking で操作
//!   （dispose で `None` にする）
//! - 条件付き更新は `UPDATE ... WHERE id = ? AND <guard>` の 1 文で、
//!   影響行数が CAS の結果
//! - 時刻は epoch ミリ秒（`*_ms INTEGER`）で保存
//! - スキーマは `extask_schema_migrations` でバージョン管理

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

use crate::domain::ids::TaskId;
use crate::domain::state::TaskState;
use crate::ports::{LeaseGuard, StoreError, TaskFilter, TaskPatch, TaskRow, TaskStore};

const SCHEMA_VERSION: i64 = 1;

const COLUMNS: &str = "id, topic, correlation_id, process_model_id, process_instance_id, \
     flow_node_instance_id, caller_context, payload, worker_id, lock_expiration_ms, state, \
     result, error, created_at_ms, finished_at_ms";

/// SqliteTaskStore は単一ファイルの SQLite データベースに行を保存
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteTaskStore {
    /// データベースファイルを開く（なければ作成）。スキーマは `initialize` で同期する。
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Backend(format!("open sqlite task store: {}", e)))?;
        debug!(path = %path.display(), "opened sqlite task store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Backend(format!("open in-memory sqlite: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| StoreError::Backend(format!("set busy timeout: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// 接続を取り出して blocking スレッドで `f` を実行
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite task store lock poisoned".to_string()))?;
            let conn = guard.as_ref().ok_or(StoreError::Disposed)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("{} task join: {}", op, e)))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.with_conn("initialize", ensure_schema).await
    }

    async fn dispose(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite task store lock poisoned".to_string()))?;
            if let Some(conn) = guard.take() {
                conn.close()
                    .map_err(|(_, e)| StoreError::Backend(format!("close sqlite: {}", e)))?;
                info!("sqlite task store closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("dispose task join: {}", e)))?
    }

    async fn insert(&self, row: TaskRow) -> Result<TaskId, StoreError> {
        self.with_conn("insert", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO external_tasks ({COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    row.id.as_ulid().to_string(),
                    row.topic,
                    row.correlation_id,
                    row.process_model_id,
                    row.process_instance_id,
                    row.flow_node_instance_id,
                    row.caller_context,
                    row.payload,
                    row.worker_id,
                    row.lock_expiration_time.map(dt_to_ms),
                    row.state.as_str(),
                    row.result,
                    row.error,
                    dt_to_ms(row.created_at),
                    row.finished_at.map(dt_to_ms),
                ],
            )
            .map_err(|e| StoreError::Backend(format!("insert external task: {}", e)))?;
            Ok(row.id)
        })
        .await
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
        self.with_conn("find_by_id", move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM external_tasks WHERE id = ?1"),
                    params![id.as_ulid().to_string()],
                    RawRow::read,
                )
                .optional()
                .map_err(|e| StoreError::Backend(format!("find external task: {}", e)))?;
            raw.map(RawRow::into_task_row).transpose()
        })
        .await
    }

    async fn find_all(
        &self,
        filter: &TaskFilter,
        limit: Option<usize>,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let (where_sql, mut values) = filter_clause(filter);
        let limit_sql = match limit {
            Some(limit) => {
                values.push(Value::Integer(limit as i64));
                " LIMIT ?"
            }
            None => "",
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM external_tasks WHERE {where_sql} \
             ORDER BY created_at_ms ASC, id ASC{limit_sql}"
        );
        self.with_conn("find_all", move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Backend(format!("prepare find external tasks: {}", e)))?;
            let raws = stmt
                .query_map(params_from_iter(values), RawRow::read)
                .map_err(|e| StoreError::Backend(format!("query external tasks: {}", e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Backend(format!("scan external tasks: {}", e)))?;
            raws.into_iter().map(RawRow::into_task_row).collect()
        })
        .await
    }

    async fn conditional_update(
        &self,
        id: TaskId,
        guard: &LeaseGuard,
        patch: &TaskPatch,
    ) -> Result<bool, StoreError> {
        let (set_sql, mut values) = patch_clause(patch);
        values.push(Value::Text(id.as_ulid().to_string()));
        let (guard_sql, guard_values) = guard_clause(guard);
        values.extend(guard_values);
        let sql = format!("UPDATE external_tasks SET {set_sql} WHERE id = ? AND {guard_sql}");
        self.with_conn("conditional_update", move |conn| {
            let changed = conn
                .execute(&sql, params_from_iter(values))
                .map_err(|e| StoreError::Backend(format!("conditional update: {}", e)))?;
            Ok(changed == 1)
        })
        .await
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, StoreError> {
        let (set_sql, mut values) = patch_clause(patch);
        values.push(Value::Text(id.as_ulid().to_string()));
        let sql = format!("UPDATE external_tasks SET {set_sql} WHERE id = ?");
        self.with_conn("update", move |conn| {
            let changed = conn
                .execute(&sql, params_from_iter(values))
                .map_err(|e| StoreError::Backend(format!("update external task: {}", e)))?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete_where(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        let (where_sql, values) = filter_clause(filter);
        let sql = format!("DELETE FROM external_tasks WHERE {where_sql}");
        self.with_conn("delete_where", move |conn| {
            let deleted = conn
                .execute(&sql, params_from_iter(values))
                .map_err(|e| StoreError::Backend(format!("delete external tasks: {}", e)))?;
            Ok(deleted as u64)
        })
        .await
    }
}

/// カラムをそのまま読み出した行（id / state / 時刻は未検証）
struct RawRow {
    id: String,
    topic: String,
    correlation_id: String,
    process_model_id: String,
    process_instance_id: String,
    flow_node_instance_id: String,
    caller_context: Option<String>,
    payload: Option<String>,
    worker_id: Option<String>,
    lock_expiration_ms: Option<i64>,
    state: String,
    result: Option<String>,
    error: Option<String>,
    created_at_ms: i64,
    finished_at_ms: Option<i64>,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            correlation_id: row.get(2)?,
            process_model_id: row.get(3)?,
            process_instance_id: row.get(4)?,
            flow_node_instance_id: row.get(5)?,
            caller_context: row.get(6)?,
            payload: row.get(7)?,
            worker_id: row.get(8)?,
            lock_expiration_ms: row.get(9)?,
            state: row.get(10)?,
            result: row.get(11)?,
            error: row.get(12)?,
            created_at_ms: row.get(13)?,
            finished_at_ms: row.get(14)?,
        })
    }

    fn into_task_row(self) -> Result<TaskRow, StoreError> {
        let id: TaskId = self
            .id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{}", e)))?;
        let state: TaskState = self
            .state
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("row {}: {}", id, e)))?;
        Ok(TaskRow {
            id,
            topic: self.topic,
            correlation_id: self.correlation_id,
            process_model_id: self.process_model_id,
            process_instance_id: self.process_instance_id,
            flow_node_instance_id: self.flow_node_instance_id,
            caller_context: self.caller_context,
            payload: self.payload,
            worker_id: self.worker_id,
            lock_expiration_time: self.lock_expiration_ms.map(ms_to_dt).transpose()?,
            state,
            result: self.result,
            error: self.error,
            created_at: ms_to_dt(self.created_at_ms)?,
            finished_at: self.finished_at_ms.map(ms_to_dt).transpose()?,
        })
    }
}

fn filter_clause(filter: &TaskFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values = Vec::new();

    let text_columns = [
        ("topic = ?", &filter.topic),
        ("correlation_id = ?", &filter.correlation_id),
        ("process_instance_id = ?", &filter.process_instance_id),
        ("flow_node_instance_id = ?", &filter.flow_node_instance_id),
        ("process_model_id = ?", &filter.process_model_id),
    ];
    for (clause, value) in text_columns {
        if let Some(value) = value {
            clauses.push(clause);
            values.push(Value::Text(value.clone()));
        }
    }
    if let Some(state) = filter.state {
        clauses.push("state = ?");
        values.push(Value::Text(state.as_str().to_string()));
    }
    if let Some(now) = filter.claimable_at {
        clauses.push("state = 'pending' AND (lock_expiration_ms IS NULL OR lock_expiration_ms < ?)");
        values.push(Value::Integer(dt_to_ms(now)));
    }

    if clauses.is_empty() {
        ("1 = 1".to_string(), values)
    } else {
        (format!("({})", clauses.join(") AND (")), values)
    }
}

fn guard_clause(guard: &LeaseGuard) -> (&'static str, Vec<Value>) {
    match guard {
        LeaseGuard::Claimable { now } => (
            "state = 'pending' AND (lock_expiration_ms IS NULL OR lock_expiration_ms < ?)",
            vec![Value::Integer(dt_to_ms(*now))],
        ),
        LeaseGuard::AccessibleBy { worker_id, now } => (
            "state = 'pending' AND (lock_expiration_ms IS NULL OR lock_expiration_ms < ? \
             OR worker_id = ?)",
            vec![
                Value::Integer(dt_to_ms(*now)),
                Value::Text(worker_id.clone()),
            ],
        ),
    }
}

fn patch_clause(patch: &TaskPatch) -> (String, Vec<Value>) {
    let mut sets: Vec<&'static str> = Vec::new();
    let mut values = Vec::new();

    if let Some(worker_id) = &patch.worker_id {
        sets.push("worker_id = ?");
        values.push(Value::Text(worker_id.clone()));
    }
    if let Some(until) = patch.lock_expiration_time {
        sets.push("lock_expiration_ms = ?");
        values.push(Value::Integer(dt_to_ms(until)));
    }
    if let Some(state) = patch.state {
        sets.push("state = ?");
        values.push(Value::Text(state.as_str().to_string()));
    }
    if let Some(result) = &patch.result {
        sets.push("result = ?");
        values.push(Value::Text(result.clone()));
    }
    if let Some(error) = &patch.error {
        sets.push("error = ?");
        values.push(Value::Text(error.clone()));
    }
    if let Some(finished_at) = patch.finished_at {
        sets.push("finished_at_ms = ?");
        values.push(Value::Integer(dt_to_ms(finished_at)));
    }

    if sets.is_empty() {
        // 空パッチでも影響行数でガードの成否が分かるようにする
        ("id = id".to_string(), values)
    } else {
        (sets.join(", "), values)
    }
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS extask_schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StoreError::Backend(format!("init migration table: {}", e)))?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM extask_schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Backend(format!("read schema version: {}", e)))?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Backend(format!(
            "sqlite schema version {} is newer than supported {}",
            current, SCHEMA_VERSION
        )));
    }
    if current < 1 {
        apply_migration_v1(conn)?;
        record_migration(conn, 1, "baseline_external_tasks")?;
        info!(version = 1, "applied sqlite schema migration");
    }
    Ok(())
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO extask_schema_migrations(version, name, applied_at_ms)
         VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| StoreError::Backend(format!("record migration: {}", e)))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS external_tasks (
          id TEXT PRIMARY KEY,
          topic TEXT NOT NULL,
          correlation_id TEXT NOT NULL,
          process_model_id TEXT NOT NULL,
          process_instance_id TEXT NOT NULL,
          flow_node_instance_id TEXT NOT NULL,
          caller_context TEXT,
          payload TEXT,
          worker_id TEXT,
          lock_expiration_ms INTEGER,
          state TEXT NOT NULL DEFAULT 'pending',
          result TEXT,
          error TEXT,
          created_at_ms INTEGER NOT NULL,
          finished_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_external_tasks_topic_state
          ON external_tasks(topic, state);
        CREATE INDEX IF NOT EXISTS idx_external_tasks_instance
          ON external_tasks(correlation_id, process_instance_id, flow_node_instance_id);
        CREATE INDEX IF NOT EXISTS idx_external_tasks_model
          ON external_tasks(process_model_id);
        "#,
    )
    .map_err(|e| StoreError::Backend(format!("apply migration v1: {}", e)))?;
    Ok(())
}
