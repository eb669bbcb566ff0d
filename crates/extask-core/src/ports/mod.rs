//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（SQLite など）へのインターフェースを提供し、
//! 実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - lease の排他性は TaskStore の条件付き更新で保証する
//! - 時刻と ID は Clock / IdGenerator 経由で取得する（テストで差し替え可能）

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{LeaseGuard, StoreError, TaskFilter, TaskPatch, TaskRow, TaskStore};
