//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・組み込み用の正本
//! - **SqliteTaskStore**: 本番用の正本（feature `sqlite`、デフォルトで有効）

pub mod inmem_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use self::inmem_store::InMemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite_store::SqliteTaskStore;
