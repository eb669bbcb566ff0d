//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + ジェネリック実装
//! ID は ULID (Universally Unique Lexicographically Sortable Identifier) を使用します。
//! Phantom type パターンで、種類の違う ID を型レベルで区別します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順序でソートできる
//! - **分散生成可能**: worker や orchestration が別プロセスでも調整不要
//! - **UUID互換**: 128-bit
//!
//! ## テキスト表現
//! Display は `task-<ulid>` 形式。`FromStr` はプレフィックス付き・なしの両方を受け付けます
//! （Task Store のカラムや CLI 引数から復元するため）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "task-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しません。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// ID のテキスト表現が不正
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id '{input}': {reason}")]
pub struct ParseIdError {
    pub input: String,
    pub reason: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|e| ParseIdError {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// External task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExternalTaskMarker {}

impl IdMarker for ExternalTaskMarker {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of an external task (immutable, generated at creation).
pub type TaskId = Id<ExternalTaskMarker>;
