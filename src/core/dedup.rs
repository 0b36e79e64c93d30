//! 变更去重记录
//!
//! 记录每个路径最近一次尝试传输的时间，避免同一个文件在相邻的
//! 两轮轮询中被重复上传（时钟精度只有秒级，传输本身也可能让下一轮
//! 看到新的修改时间）。

use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 去重记录
#[derive(Debug, Default)]
pub struct ChangeGuard {
    records: HashMap<PathBuf, i64>,
}

impl ChangeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本轮是否应该传输该路径
    ///
    /// 已有记录且时间不早于 `time_from` 时返回 false。
    pub fn should_transfer(&self, path: &Path, time_from: i64) -> bool {
        match self.records.get(path) {
            Some(&recorded) => recorded < time_from,
            None => true,
        }
    }

    /// 在传输之前记录（失败也算），失败的传输不会在下一轮立刻重试
    pub fn record(&mut self, path: &Path, tick_time: i64) {
        self.records.insert(path.to_path_buf(), tick_time);
    }

    /// 清除早于 `now - retention_secs` 的记录，返回清除数量
    pub fn collect_garbage(&mut self, now: i64, retention_secs: i64) -> usize {
        let horizon = now - retention_secs;
        let before = self.records.len();
        self.records.retain(|_, recorded| *recorded >= horizon);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 随机触发的垃圾回收策略
///
/// 每轮以 1/(n+1) 的概率触发，n 由期望周期和轮询间隔换算，
/// 使触发频率与轮询间隔无关。
#[derive(Debug, Clone, Copy)]
pub struct GcTrigger {
    one_in: u64,
}

impl GcTrigger {
    pub fn new(period_secs: u64, interval_ms: u64) -> Self {
        let one_in = period_secs.saturating_mul(1000) / interval_ms.max(1);
        Self { one_in }
    }

    /// 平均每多少轮触发一次
    pub fn expected_ticks(&self) -> u64 {
        self.one_in + 1
    }

    pub fn should_collect<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.gen_range(0..=self.one_in) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_unknown_path_is_transferred() {
        let guard = ChangeGuard::new();
        assert!(guard.should_transfer(Path::new("/p/a.txt"), 100));
    }

    #[test]
    fn test_recent_record_suppresses_transfer() {
        let mut guard = ChangeGuard::new();
        let path = Path::new("/p/d.txt");
        guard.record(path, 100);

        for time_from in [0, 50, 99, 100] {
            assert!(!guard.should_transfer(path, time_from), "time_from={time_from}");
        }
        assert!(guard.should_transfer(path, 101));
    }

    #[test]
    fn test_garbage_collection_uses_retention_horizon() {
        let mut guard = ChangeGuard::new();
        guard.record(Path::new("/p/old"), 100);
        guard.record(Path::new("/p/edge"), 140);
        guard.record(Path::new("/p/new"), 190);

        let collected = guard.collect_garbage(200, 60);
        assert_eq!(collected, 1);
        assert_eq!(guard.len(), 2);
        assert!(guard.should_transfer(Path::new("/p/old"), 0));
        assert!(!guard.should_transfer(Path::new("/p/edge"), 140));
    }

    #[test]
    fn test_transfer_allowed_after_retention_and_gc() {
        let mut guard = ChangeGuard::new();
        let path = Path::new("/p/a.txt");
        guard.record(path, 100);

        guard.collect_garbage(100 + 61, 60);
        assert!(guard.is_empty());
        assert!(guard.should_transfer(path, 100 + 61));
    }

    #[test]
    fn test_gc_trigger_frequency() {
        // 100ms 间隔、20 分钟周期 -> 约 12000 轮一次
        let trigger = GcTrigger::new(1200, 100);
        assert_eq!(trigger.expected_ticks(), 12_001);

        let mut rng = StdRng::seed_from_u64(7);
        let hits = (0..120_010)
            .filter(|_| trigger.should_collect(&mut rng))
            .count();
        assert!((1..=40).contains(&hits), "hits={hits}");
    }

    #[test]
    fn test_gc_trigger_degenerate_interval() {
        let trigger = GcTrigger::new(0, 100);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(trigger.should_collect(&mut rng));
    }
}
