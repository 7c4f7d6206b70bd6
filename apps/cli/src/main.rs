//! # Busview CLI
//!
//! CAN 总线会话引擎的命令行前端。
//!
//! ## One-shot 模式
//!
//! 每个命令独立执行：读取配置 -> 连接 -> 执行 -> 断开。
//!
//! ```bash
//! # 配置默认接口
//! busview config set defaults.interface can0
//!
//! # 启用链路并监视 10 秒，同时记录 CSV
//! busview up can0 --bitrate 250000
//! busview monitor --duration 10 --csv log.csv
//!
//! # 符号化发送：冷却液温度 85°C
//! busview send --pgn Temps --field cool=85
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod modes;

use commands::{
    ConfigCommand, DecodeCommand, LinkCommand, MonitorCommand, PresetsCommand, SelfTestCommand,
    SendCommand,
};
use modes::oneshot::OneShotMode;

/// Busview CLI - CAN / J1939 总线工具
#[derive(Parser, Debug)]
#[command(name = "busview")]
#[command(about = "CAN session and streaming tool with J1939 decoding", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 <config_dir>/busview/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 列出候选接口
    Interfaces {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },

    /// 链路管理（up / down / status）
    #[command(flatten)]
    Link(LinkCommand),

    /// 监视总线
    Monitor {
        #[command(flatten)]
        args: MonitorCommand,
    },

    /// 发送帧
    Send {
        #[command(flatten)]
        args: SendCommand,
    },

    /// 自检：发送测试帧并等待回显
    Selftest {
        #[command(flatten)]
        args: SelfTestCommand,
    },

    /// 列出预设与分组
    Presets {
        #[command(flatten)]
        args: PresetsCommand,
    },

    /// 离线解码一帧
    Decode {
        #[command(flatten)]
        args: DecodeCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("busview_cli=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config(cmd) => cmd.execute(cli.config).await,

        Commands::Interfaces { json } => commands::link::list_interfaces(json).await,

        Commands::Link(cmd) => cmd.execute().await,

        Commands::Monitor { args } => {
            let mode = OneShotMode::load(cli.config)?;
            args.execute(&mode).await
        },

        Commands::Send { args } => {
            let mode = OneShotMode::load(cli.config)?;
            args.execute(&mode).await
        },

        Commands::Selftest { args } => {
            let mode = OneShotMode::load(cli.config)?;
            args.execute(&mode).await
        },

        Commands::Presets { args } => {
            let mode = OneShotMode::load(cli.config)?;
            args.execute(&mode).await
        },

        Commands::Decode { args } => {
            let mode = OneShotMode::load(cli.config)?;
            args.execute(&mode)
        },
    }
}
