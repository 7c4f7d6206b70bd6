//! 会话性能指标
//!
//! 全部为原子计数器，接收线程、发送线程与查询线程之间无锁共享。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// 接收到的帧数（含本端回显）
    pub rx_frames: AtomicU64,
    /// 成功写入适配器的帧数
    pub tx_frames: AtomicU64,
    /// 接收超时次数（无数据时的正常轮询结果）
    pub rx_timeouts: AtomicU64,
    /// 驱动报告的损坏帧数
    pub corrupt_frames: AtomicU64,
    /// 匹配到 PGN 定义的帧数
    pub decode_hits: AtomicU64,
    pub tx_errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// `dropped_frames` 由广播中心统计，调用方传入
    pub fn snapshot(&self, dropped_frames: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_timeouts: self.rx_timeouts.load(Ordering::Relaxed),
            corrupt_frames: self.corrupt_frames.load(Ordering::Relaxed),
            decode_hits: self.decode_hits.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            dropped_frames,
        }
    }

    pub fn reset(&self) {
        self.rx_frames.store(0, Ordering::Relaxed);
        self.tx_frames.store(0, Ordering::Relaxed);
        self.rx_timeouts.store(0, Ordering::Relaxed);
        self.corrupt_frames.store(0, Ordering::Relaxed);
        self.decode_hits.store(0, Ordering::Relaxed);
        self.tx_errors.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub rx_timeouts: u64,
    pub corrupt_frames: u64,
    pub decode_hits: u64,
    pub tx_errors: u64,
    pub dropped_frames: u64,
}
