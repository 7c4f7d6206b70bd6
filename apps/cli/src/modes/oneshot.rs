//! One-shot 模式
//!
//! 每个命令独立执行：
//! 1. 读取配置（`BusviewConfig`）并构建 PGN 编解码表
//! 2. 按需启用链路、连接会话
//! 3. 执行操作
//! 4. 断开连接（`Session` drop 时也会断开）

use anyhow::{Context, Result};
use busview_can::{BackendKind, InterfaceKind, LifecycleManager, LinkState};
use busview_driver::{BusviewConfig, JsonPresetStore, Session};
use busview_protocol::CodecRegistry;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// 连接参数（命令行优先于配置文件）
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// CAN 接口（覆盖配置）
    #[arg(short, long)]
    pub interface: Option<String>,

    /// 后端：socketcan / gs_usb / loopback
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// 波特率（bit/s）
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// 连接前先配置并启用链路
    #[arg(long)]
    pub up: bool,
}

/// 解析后的连接目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub interface: String,
    pub backend: BackendKind,
    pub bitrate: Option<u32>,
}

/// One-shot 模式
pub struct OneShotMode {
    config: BusviewConfig,
}

/// 配置文件路径：显式路径优先
pub fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => BusviewConfig::default_path().ok_or_else(|| anyhow::anyhow!("无法确定配置目录")),
    }
}

impl OneShotMode {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path(explicit)?;
        let config = BusviewConfig::load(&config_path)
            .with_context(|| format!("读取配置文件失败: {}", config_path.display()))?;
        Ok(Self { config })
    }

    #[cfg(test)]
    pub fn from_config(config: BusviewConfig) -> Self {
        Self { config }
    }

    pub fn registry(&self) -> Result<Arc<CodecRegistry>> {
        let registry = self
            .config
            .build_registry()
            .context("PGN 定义无效（检查配置中的 [[pgn]] 表）")?;
        Ok(Arc::new(registry))
    }

    pub fn preset_store(&self) -> JsonPresetStore {
        JsonPresetStore::new(self.config.presets_path(), self.config.groups_path())
    }

    /// 命令行显式给出接口但没给后端时，按接口名推断后端
    pub fn target(&self, args: &ConnectionArgs) -> Target {
        let defaults = &self.config.defaults;
        let interface = args
            .interface
            .clone()
            .unwrap_or_else(|| defaults.interface.clone());
        let backend = args.backend.unwrap_or_else(|| {
            if args.interface.is_some() {
                BackendKind::for_interface(&interface)
            } else {
                defaults.backend
            }
        });
        Target {
            interface,
            backend,
            bitrate: args.bitrate.or(defaults.bitrate),
        }
    }

    /// 连接会话（阻塞）
    pub fn connect(&self, args: &ConnectionArgs) -> Result<(Session, Target)> {
        let target = self.target(args);

        if args.up && target.backend == BackendKind::SocketCan {
            println!("⏳ 启用链路 {}...", target.interface);
            let state = LifecycleManager::system()
                .bring_up(&target.interface, target.bitrate)
                .with_context(|| format!("启用链路 {} 失败", target.interface))?;
            if state != LinkState::Up {
                anyhow::bail!("链路 {} 状态为 {}", target.interface, state);
            }
        }

        let session = Session::new(self.config.session.clone(), self.registry()?);
        println!("⏳ 连接到 {} ({})...", target.interface, target.backend);
        session
            .connect(&target.interface, target.backend, target.bitrate)
            .with_context(|| {
                let hint = match InterfaceKind::classify(&target.interface) {
                    InterfaceKind::Virtual => "（虚拟接口可用 `busview up` 创建）",
                    InterfaceKind::Physical => "（确认链路已启用：`busview status`）",
                    InterfaceKind::Vendor => "（确认 USB 适配器已连接）",
                };
                format!("连接 {} 失败{}", target.interface, hint)
            })?;
        info!("Connected to {} via {}", target.interface, target.backend);
        println!("✅ 已连接");

        Ok((session, target))
    }
}
