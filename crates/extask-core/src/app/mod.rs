//! App - アプリケーション層
//!
//! ports を組み合わせて external task のライフサイクルを実装します。
//!
//! # 主要コンポーネント
//! - **TaskLedger**: 行 ↔ ExternalTask の対応付け、作成と参照
//! - **LeaseManager**: 取得（claim）、lease 延長、完了（成功・失敗）
//! - **TaskFacade**: orchestration 向けの作成・参照・管理用削除
//! - **EngineBuilder / Engine**: ワイヤリングと store のライフサイクル
//! - **EngineConfig**: TOML 設定

pub mod builder;
pub mod config;
pub mod facade;
pub mod lease_manager;
pub mod ledger;

pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::config::{ConfigError, EngineConfig, LeaseConfig, StoreConfig, StoreKind};
pub use self::facade::TaskFacade;
pub use self::lease_manager::LeaseManager;
pub use self::ledger::TaskLedger;
