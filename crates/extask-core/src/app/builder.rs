//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 設計
//! - グローバルな接続やシングルトンは持たない（store は明示的に渡す）
//! - 起動時検証（Fail-fast）: store 未指定や不正な lease 期間は build() で弾く

use std::sync::Arc;

use tracing::info;

use crate::domain::errors::LeaseError;
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, IdGenerator, StoreError, SystemClock, TaskStore, UlidGenerator};

use super::config::{EngineConfig, LeaseConfig, StoreKind};
use super::facade::TaskFacade;
use super::lease_manager::LeaseManager;
use super::ledger::TaskLedger;

/// EngineBuilder は Engine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .store(Arc::new(InMemoryTaskStore::new()))
///     .build()?;
/// engine.initialize().await?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    lease: LeaseConfig,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no task store configured")]
    MissingStore,

    #[error("default lock duration must be positive")]
    InvalidLockDuration,

    #[error("store kind {0:?} is not compiled in (enable the `sqlite` feature)")]
    UnsupportedStore(StoreKind),

    #[error("failed to open task store: {0}")]
    Store(#[from] StoreError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定に従って store を開いた builder を作る
    pub fn from_config(config: &EngineConfig) -> Result<Self, BuildError> {
        let store: Arc<dyn TaskStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(InMemoryTaskStore::new()),
            #[cfg(feature = "sqlite")]
            StoreKind::Sqlite => Arc::new(crate::impls::SqliteTaskStore::open(&config.store.path)?),
            #[cfg(not(feature = "sqlite"))]
            StoreKind::Sqlite => return Err(BuildError::UnsupportedStore(StoreKind::Sqlite)),
        };
        Ok(Self::new().store(store).lease_config(config.lease.clone()))
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 時刻の差し替え（テストでは FixedClock）
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn lease_config(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        if self.lease.default_lock_duration_ms == 0 {
            return Err(BuildError::InvalidLockDuration);
        }
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(clock.clone())),
        };

        let ledger = TaskLedger::new(store.clone(), clock.clone(), ids);
        Ok(Engine {
            facade: TaskFacade::new(ledger.clone(), store.clone()),
            leases: LeaseManager::new(
                ledger,
                store.clone(),
                clock,
                self.lease.default_lock_duration(),
            ),
            store,
        })
    }
}

/// Engine は facade（orchestration 用）と lease manager（worker 用）を束ねる
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn TaskStore>,
    facade: TaskFacade,
    leases: LeaseManager,
}

impl Engine {
    pub fn facade(&self) -> &TaskFacade {
        &self.facade
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// store のスキーマ同期
    pub async fn initialize(&self) -> Result<(), LeaseError> {
        self.store.initialize().await?;
        info!("extask engine initialized");
        Ok(())
    }

    pub async fn dispose(&self) -> Result<(), LeaseError> {
        self.store.dispose().await?;
        info!("extask engine disposed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::blob::Blob;
    use crate::domain::task::NewExternalTask;
    use chrono::Duration;

    #[test]
    fn build_without_store_fails() {
        let result = EngineBuilder::new().build();
        assert!(matches!(result, Err(BuildError::MissingStore)));
    }

    #[test]
    fn build_rejects_zero_lock_duration() {
        let result = EngineBuilder::new()
            .store(Arc::new(InMemoryTaskStore::new()))
            .lease_config(LeaseConfig {
                default_lock_duration_ms: 0,
            })
            .build();
        assert!(matches!(result, Err(BuildError::InvalidLockDuration)));
    }

    #[tokio::test]
    async fn memory_config_builds_a_working_engine() {
        let config = EngineConfig::from_toml_str(
            "[store]\nkind = \"memory\"\n[lease]\ndefault_lock_duration_ms = 2000\n",
        )
        .unwrap();
        let engine = EngineBuilder::from_config(&config).unwrap().build().unwrap();
        engine.initialize().await.unwrap();

        assert_eq!(engine.leases().default_lock_duration(), Duration::seconds(2));

        let id = engine
            .facade()
            .create(NewExternalTask {
                topic: "t1".into(),
                correlation_id: "c".into(),
                process_model_id: "m".into(),
                process_instance_id: "p".into(),
                flow_node_instance_id: "f".into(),
                caller_context: Blob::default(),
                payload: Blob::new("{}"),
            })
            .await
            .unwrap();
        let locked = engine
            .leases()
            .fetch_and_lock("w", "t1", 1, engine.leases().default_lock_duration())
            .await
            .unwrap();
        assert_eq!(locked[0].id, id);

        engine.dispose().await.unwrap();
        assert!(matches!(
            engine.facade().get_by_id(id).await,
            Err(LeaseError::Store(StoreError::Disposed))
        ));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_config_opens_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.store.path = dir.path().join("engine.db");

        let engine = EngineBuilder::from_config(&config).unwrap().build().unwrap();
        engine.initialize().await.unwrap();
        engine.dispose().await.unwrap();

        assert!(config.store.path.exists());
    }
}
