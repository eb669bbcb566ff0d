//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はタスク ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能（作成順に並ぶ）
/// - 分散環境で生成可能（調整不要）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock の時刻を timestamp 部分に使うので、FixedClock と組み合わせると
/// timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("task-"));
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
