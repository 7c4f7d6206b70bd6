//! 链路命令：接口发现与 up / down / status

use anyhow::{Context, Result};
use busview_can::{InterfaceEnumerator, LifecycleManager, LinkState, SystemEnumerator};
use busview_driver::BringUpRequest;
use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum LinkCommand {
    /// 配置并启用链路（虚拟接口不存在时自动创建）
    Up {
        /// 接口名称
        interface: String,

        /// 波特率（bit/s），虚拟接口忽略
        #[arg(short, long)]
        bitrate: Option<u32>,

        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },

    /// 关闭链路
    Down {
        /// 接口名称
        interface: String,
    },

    /// 查询链路状态
    Status {
        /// 接口名称
        interface: String,
    },
}

impl LinkCommand {
    pub async fn execute(self) -> Result<()> {
        match self {
            LinkCommand::Up {
                interface,
                bitrate,
                json,
            } => {
                if !json {
                    println!("⏳ 启用链路 {}...", interface);
                }
                let request = BringUpRequest {
                    interface_name: interface.clone(),
                    bitrate,
                };
                let report =
                    tokio::task::spawn_blocking(move || request.execute(&LifecycleManager::system()))
                        .await?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else if report.ok {
                    println!("✅ {} 已启用", interface);
                } else {
                    println!(
                        "❌ {}: {}（链路状态 {}）",
                        interface,
                        report.detail.as_deref().unwrap_or("未知错误"),
                        report.resulting_link_state
                    );
                }
                if !report.ok {
                    anyhow::bail!("启用链路 {} 失败", interface);
                }
                Ok(())
            },

            LinkCommand::Down { interface } => {
                let name = interface.clone();
                let state = tokio::task::spawn_blocking(move || {
                    LifecycleManager::system().bring_down(&name)
                })
                .await?
                .with_context(|| format!("关闭链路 {} 失败", interface))?;
                println!("✅ {} 状态: {}", interface, state);
                Ok(())
            },

            LinkCommand::Status { interface } => {
                let name = interface.clone();
                let state = tokio::task::spawn_blocking(move || {
                    LifecycleManager::system().status(&name)
                })
                .await?
                .with_context(|| format!("查询链路 {} 失败", interface))?;
                let marker = if state == LinkState::Up { "✅" } else { "⚠️ " };
                println!("{} {}: {}", marker, interface, state);
                Ok(())
            },
        }
    }
}

/// 列出候选接口
pub async fn list_interfaces(json: bool) -> Result<()> {
    let interfaces = tokio::task::spawn_blocking(|| SystemEnumerator::new().list()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&interfaces)?);
        return Ok(());
    }

    println!("{:<12} {:<10} {:<12} 波特率", "接口", "类型", "状态");
    for info in &interfaces {
        let bitrate = info
            .bitrate
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<10} {:<12} {}",
            info.name,
            info.kind.to_string(),
            info.link_state.to_string(),
            bitrate
        );
    }
    Ok(())
}
