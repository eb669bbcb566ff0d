//! extask-core
//!
//! Durable external-task leasing engine: competing workers fetch tasks on a
//! topic, hold them under a time-bounded lease, and report results back.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, ExternalTask, state, blob, failure, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（ledger, lease_manager, facade, builder, config）
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Engine, EngineBuilder, EngineConfig, LeaseManager, TaskFacade};
pub use domain::{
    Blob, ErrorPayload, ExternalTask, FailureKind, InstanceTriple, LeaseError, NewExternalTask,
    TaskFailure, TaskId, TaskState,
};
