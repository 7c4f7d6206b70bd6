//! 配置管理命令
//!
//! 以点分路径读写 `config.toml`（如 `defaults.interface`、`session.receive_timeout_ms`）

use anyhow::{Context, Result};
use busview_driver::BusviewConfig;
use clap::Subcommand;
use std::path::{Path, PathBuf};

use crate::modes::oneshot::config_path;

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 设置配置项
    Set {
        /// 配置项路径（如 defaults.interface）
        key: String,

        /// 值（按 TOML 字面量解析，如 250000、true、"can0"）
        value: String,
    },

    /// 获取配置项
    Get {
        /// 配置项路径
        #[arg(default_value = "all")]
        key: String,
    },

    /// 检查配置（包括 PGN 覆盖的参考帧校验）
    Check,

    /// 显示配置文件路径
    Path,
}

impl ConfigCommand {
    pub async fn execute(self, explicit: Option<PathBuf>) -> Result<()> {
        let path = config_path(explicit)?;
        match self {
            ConfigCommand::Set { key, value } => Self::set_(&path, &key, &value),

            ConfigCommand::Get { key } => Self::get_(&path, &key),

            ConfigCommand::Check => Self::check_(&path),

            ConfigCommand::Path => {
                println!("{}", path.display());
                Ok(())
            },
        }
    }

    fn set_(path: &Path, key: &str, value: &str) -> Result<()> {
        let mut config = load(path)?;
        config
            .set(key, value)
            .with_context(|| format!("无法设置 {}", key))?;
        // 保存前确认 PGN 覆盖仍然有效
        config.build_registry().context("修改后的配置无效")?;
        config.save(path).context("写入配置文件失败")?;

        println!("✅ 设置 {} = {}", key, value);
        Ok(())
    }

    fn get_(path: &Path, key: &str) -> Result<()> {
        let config = load(path)?;

        if key == "all" {
            print!("{}", config.to_toml()?);
            return Ok(());
        }

        match config.get(key)? {
            Some(toml::Value::String(s)) => println!("{}", s),
            Some(value) => println!("{}", value),
            None => println!("(未设置)"),
        }
        Ok(())
    }

    fn check_(path: &Path) -> Result<()> {
        let config = load(path)?;
        let registry = config.build_registry().context("PGN 定义校验失败")?;

        println!("配置文件: {}", path.display());
        if !path.exists() {
            println!("  (文件不存在，使用默认值)");
        }
        println!("  接口: {}", config.defaults.interface);
        println!("  后端: {}", config.defaults.backend);
        match config.defaults.bitrate {
            Some(bitrate) => println!("  波特率: {}", bitrate),
            None => println!("  波特率: (未设置)"),
        }
        println!("  接收超时: {} ms", config.session.receive_timeout_ms);
        println!("  订阅队列: {}", config.session.subscriber_capacity);
        println!(
            "  PGN 定义: {} 个（其中 {} 个来自配置）",
            registry.len(),
            config.pgn.len()
        );
        println!("  预设文件: {}", config.presets_path().display());
        println!("  分组文件: {}", config.groups_path().display());
        println!("✅ 配置有效");

        Ok(())
    }
}

fn load(path: &Path) -> Result<BusviewConfig> {
    BusviewConfig::load(path).with_context(|| format!("读取配置文件失败: {}", path.display()))
}
