//! Clock port - 時刻の抽象化
//!
//! lease の判定（期限切れかどうか）はすべてこの Clock の時刻で行います。
//! - **SystemClock**: 本番用
//! - **FixedClock**: テスト用（手動で進める）

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Clock は現在時刻を提供
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから共有される）
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// ミリ秒に切り捨てた現在時刻
    ///
    /// ストアはミリ秒精度で保存するため、比較・保存・返却する時刻はすべてこちらを使う。
    fn now_ms(&self) -> DateTime<Utc> {
        self.now().trunc_subsecs(3)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// SystemClock は OS の時刻を返す
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// FixedClock は明示的に進めない限り同じ時刻を返す
///
/// lease の期限切れをテストで再現するために使います。
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// 時刻を `by` だけ進める
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}
