//! 自检命令

use anyhow::Result;
use busview_driver::SelfTestReport;
use clap::Args;
use std::time::Duration;

use crate::modes::oneshot::{ConnectionArgs, OneShotMode};

/// 自检命令参数
#[derive(Args, Debug)]
pub struct SelfTestCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// 等待回显的时间（毫秒）
    #[arg(short, long, default_value_t = 300)]
    pub timeout_ms: u64,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

impl SelfTestCommand {
    pub async fn execute(self, mode: &OneShotMode) -> Result<()> {
        let (session, target) = mode.connect(&self.connection)?;
        let timeout = Duration::from_millis(self.timeout_ms);
        let report = tokio::task::spawn_blocking(move || session.selftest(timeout)).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&target.interface, &report);
        }

        if !report.echo_rx {
            anyhow::bail!("自检失败: 未收到回显");
        }
        Ok(())
    }
}

fn mark(ok: bool) -> &'static str {
    if ok { "✅" } else { "❌" }
}

fn print_report(interface: &str, report: &SelfTestReport) {
    println!("自检 {}:", interface);
    println!("  {} 已连接", mark(report.connected));
    println!("  {} 发送测试帧", mark(report.tx_ok));
    println!("  {} 收到回显", mark(report.echo_rx));
    println!("  期间收到 {} 帧", report.rx_seen);
    if let Some(error) = &report.error {
        println!("  错误: {}", error);
    }
}
