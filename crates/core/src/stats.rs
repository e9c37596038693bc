//! 服务端计数器快照与对账
//!
//! 服务端的 valid/invalid 计数是账户全生命周期的累计值，不按周期清零。
//! 本地用 RunningTotals 保存最近一次对账的基线，每个周期结束后用
//! after 快照减去基线得到本周期的增量。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 服务端计数器快照
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    /// 累计验证通过数
    pub valid_count: u64,
    /// 累计验证失败数
    pub invalid_count: u64,
    /// 快照采集时间
    pub captured_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn new(valid_count: u64, invalid_count: u64) -> Self {
        Self {
            valid_count,
            invalid_count,
            captured_at: Utc::now(),
        }
    }
}

/// 进程级基线 - 最近一次对账后的累计计数
///
/// 进程启动时未播种，首次对账用 before 快照播种而不是假定为零，
/// 因为服务端计数跨进程累计。只由对账逻辑修改。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningTotals {
    valid_count: u64,
    invalid_count: u64,
    seeded: bool,
}

impl RunningTotals {
    /// 用指定计数构造已播种的基线（测试与快照恢复用）
    pub fn seeded(valid_count: u64, invalid_count: u64) -> Self {
        Self {
            valid_count,
            invalid_count,
            seeded: true,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn valid_count(&self) -> u64 {
        self.valid_count
    }

    pub fn invalid_count(&self) -> u64 {
        self.invalid_count
    }

    fn set(&mut self, snapshot: &StatsSnapshot) {
        self.valid_count = snapshot.valid_count;
        self.invalid_count = snapshot.invalid_count;
        self.seeded = true;
    }
}

/// 单周期增量
///
/// 正常情况下两个增量都应 >= 0；负值说明服务端计数器被重置，
/// 按原值上报而不是静默钳为零。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CycleOutcome {
    pub valid_delta: i64,
    pub invalid_delta: i64,
}

/// 超出 i64 范围的计数钳到 i64::MAX，增量计算不回绕
fn saturate(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// 对账：用 after 快照减去本地基线得到本周期增量，并推进基线
///
/// 首次调用时先用 before 播种基线。
pub fn reconcile(
    before: &StatsSnapshot,
    after: &StatsSnapshot,
    totals: &mut RunningTotals,
) -> CycleOutcome {
    if !totals.is_seeded() {
        totals.set(before);
    }

    let valid_delta = saturate(after.valid_count) - saturate(totals.valid_count);
    let invalid_delta = saturate(after.invalid_count) - saturate(totals.invalid_count);

    if valid_delta < 0 || invalid_delta < 0 {
        tracing::warn!(
            valid_delta,
            invalid_delta,
            "服务端计数器出现回退，疑似被重置"
        );
    }

    totals.set(after);

    CycleOutcome {
        valid_delta,
        invalid_delta,
    }
}
