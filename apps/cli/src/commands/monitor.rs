//! 监视命令
//!
//! 连接后在终端打印每一帧，可同时把帧流写入 CSV / JSON Lines 文件。
//! 文件输出各自运行在独立的投递线程上，慢磁盘不会拖慢终端显示。

use anyhow::{Context, Result};
use busview_driver::{
    CsvLogSink, FrameSink, HubEvent, JsonLinesSink, ReceivedFrame, Session, StreamEvent,
    spawn_delivery,
};
use busview_protocol::Direction;
use clap::Args;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::modes::oneshot::{ConnectionArgs, OneShotMode};

/// 监视命令参数
#[derive(Args, Debug)]
pub struct MonitorCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// 监视时长（秒），0 表示直到 Ctrl+C
    #[arg(short, long, default_value_t = 0)]
    pub duration: u64,

    /// 收到指定帧数后停止
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// 只显示匹配的 ID（十六进制，可重复）
    #[arg(long = "filter", value_parser = parse_id_hex)]
    pub filter: Vec<u32>,

    /// 同时写入 CSV 日志
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// 同时写入 JSON Lines
    #[arg(long)]
    pub jsonl: Option<PathBuf>,

    /// 终端以 JSON 事件输出
    #[arg(long)]
    pub json: bool,
}

fn parse_id_hex(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{}': {}", s, e))
}

impl MonitorCommand {
    pub async fn execute(self, mode: &OneShotMode) -> Result<()> {
        let (session, target) = mode.connect(&self.connection)?;

        let mut deliveries = Vec::new();
        if let Some(path) = &self.csv {
            deliveries.push(open_sink(&session, path, |file| {
                Box::new(CsvLogSink::new(file))
            })?);
        }
        if let Some(path) = &self.jsonl {
            deliveries.push(open_sink(&session, path, |file| {
                Box::new(JsonLinesSink::new(file))
            })?);
        }

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
        })
        .context("设置信号处理失败")?;

        if !self.json {
            println!("📡 监视 {}（Ctrl+C 退出）", target.interface);
        }

        let (session, shown) =
            tokio::task::spawn_blocking(move || -> Result<(Session, u64)> {
                let shown = self.run(&session, &running)?;
                Ok((session, shown))
            })
            .await??;

        let health = session.health();
        session.disconnect();

        for (path, handle) in deliveries {
            match handle.join() {
                Ok(Ok(written)) => println!("💾 {}: {} 帧", path.display(), written),
                Ok(Err(e)) => println!("❌ {}: {}", path.display(), e),
                Err(_) => println!("❌ {}: 投递线程异常退出", path.display()),
            }
        }

        println!(
            "\n✅ 显示 {} 帧（接收 {}，解码 {}，丢弃 {}，损坏 {}）",
            shown,
            health.metrics.rx_frames,
            health.metrics.decode_hits,
            health.metrics.dropped_frames,
            health.metrics.corrupt_frames
        );
        if let Some(error) = health.last_error {
            anyhow::bail!("会话异常结束: {}", error);
        }
        Ok(())
    }

    fn run(&self, session: &Session, running: &AtomicBool) -> Result<u64> {
        let subscription = session.subscribe();
        let deadline =
            (self.duration > 0).then(|| Instant::now() + Duration::from_secs(self.duration));
        let mut shown = 0u64;

        while running.load(Ordering::SeqCst) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            if self.count.is_some_and(|n| shown >= n) {
                break;
            }

            let event = match subscription.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => event,
                Err(e) if e.is_timeout() => continue,
                Err(_) => break,
            };

            match &event {
                HubEvent::Frame(received) => {
                    if !self.filter.is_empty() && !self.filter.contains(&received.frame.id()) {
                        continue;
                    }
                    shown += 1;
                    if self.json {
                        println!("{}", serde_json::to_string(&StreamEvent::from(&event))?);
                    } else {
                        println!("{}", format_frame(received));
                    }
                },
                HubEvent::EndOfStream { reason } => {
                    if self.json {
                        println!("{}", serde_json::to_string(&StreamEvent::from(&event))?);
                    } else {
                        println!("⚠️  流结束: {}", reason);
                    }
                    break;
                },
            }
        }

        if subscription.dropped() > 0 {
            println!("⚠️  终端输出跟不上，丢弃 {} 帧", subscription.dropped());
        }
        Ok(shown)
    }
}

type Delivery = (PathBuf, JoinHandle<io::Result<u64>>);

fn open_sink(
    session: &Session,
    path: &PathBuf,
    make: impl FnOnce(BufWriter<File>) -> Box<dyn FrameSink>,
) -> Result<Delivery> {
    let file = File::create(path).with_context(|| format!("无法创建 {}", path.display()))?;
    let handle = spawn_delivery(session.subscribe(), make(BufWriter::new(file)));
    Ok((path.clone(), handle))
}

/// 单行显示：时间戳、方向、ID、DLC、负载、解码字段
fn format_frame(received: &ReceivedFrame) -> String {
    let frame = &received.frame;
    let direction = match frame.direction() {
        Direction::Rx => "RX",
        Direction::Tx => "TX",
    };
    let mut line = format!(
        "{:>12.6}  {}  {:>8}  [{}]  {:<16}",
        frame.timestamp(),
        direction,
        frame.id_hex(),
        frame.len(),
        frame.payload_hex()
    );
    if let Some(decoded) = &received.decoded {
        line.push_str(&format!("  {} (sa={:02X})", decoded.name, decoded.source_address));
        for (key, value) in &decoded.fields {
            line.push_str(&format!(" {}={}", key, value));
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use busview_protocol::{BusFrame, CodecRegistry};

    #[test]
    fn test_parse_id_hex() {
        assert_eq!(parse_id_hex("18FEEE00"), Ok(0x18FEEE00));
        assert_eq!(parse_id_hex("0x123"), Ok(0x123));
        assert!(parse_id_hex("zz").is_err());
    }

    #[test]
    fn test_format_frame() {
        let frame = BusFrame::new_extended(0x18FEEE00, &[0x7D])
            .unwrap()
            .with_timestamp(1.25);
        let decoded = CodecRegistry::builtin().decode(frame.id(), frame.data()).ok();
        let line = format_frame(&ReceivedFrame { frame, decoded });

        assert!(line.contains("RX"));
        assert!(line.contains("18FEEE00"));
        assert!(line.contains("[1]"));
        assert!(line.contains("Temps (sa=00)"));
        assert!(line.contains("cool=85"));
        assert!(line.contains("fuel_temp=N/A"));
    }
}
