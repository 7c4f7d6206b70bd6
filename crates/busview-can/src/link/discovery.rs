//! 候选接口发现

use super::probe::parse_link_list;
use super::{CommandRunner, InterfaceKind, LinkState, SystemRunner};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 始终列出的默认接口
const BASELINE: [&str; 2] = ["vcan0", "can0"];

/// `/sys/class/net/<name>/flags` 中的 IFF_UP 位
const IFF_UP: u32 = 0x1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    pub name: String,
    pub kind: InterfaceKind,
    pub link_state: LinkState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

impl InterfaceInfo {
    fn baseline(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: InterfaceKind::classify(name),
            link_state: LinkState::Down,
            bitrate: None,
        }
    }
}

pub trait InterfaceEnumerator: Send + Sync {
    fn list(&self) -> Vec<InterfaceInfo>;
}

/// 系统接口枚举：`ip` + `/sys/class/net` + GS-USB 设备
///
/// `ip ... type can` 不列出 vcan 链路，因此 sysfs 总是会被扫描；同名接口以 `ip`
/// 的结果为准（带波特率）。
pub struct SystemEnumerator {
    runner: Arc<dyn CommandRunner>,
    sys_class_net: PathBuf,
    include_usb: bool,
}

impl SystemEnumerator {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(SystemRunner),
            sys_class_net: PathBuf::from("/sys/class/net"),
            include_usb: cfg!(feature = "gs_usb"),
        }
    }

    /// 替换命令执行器与 sysfs 根目录，不扫描 USB
    pub fn with_sources(runner: Arc<dyn CommandRunner>, sys_class_net: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            sys_class_net: sys_class_net.into(),
            include_usb: false,
        }
    }

    fn from_ip(&self) -> Vec<InterfaceInfo> {
        let args: Vec<String> = ["-details", "-json", "link", "show", "type", "can"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match self.runner.run("ip", &args) {
            Ok(output) if output.success => parse_link_list(&output.stdout)
                .into_iter()
                .map(|(name, status)| InterfaceInfo {
                    kind: InterfaceKind::classify(&name),
                    name,
                    link_state: status.state,
                    bitrate: status.bitrate,
                })
                .collect(),
            Ok(output) => {
                debug!("ip link listing failed: {}", output.stderr.trim());
                Vec::new()
            },
            Err(e) => {
                debug!("ip link listing unavailable: {}", e);
                Vec::new()
            },
        }
    }

    fn from_sysfs(&self) -> Vec<InterfaceInfo> {
        let Ok(entries) = fs::read_dir(&self.sys_class_net) else {
            return Vec::new();
        };
        let mut found: Vec<InterfaceInfo> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                if !(name.starts_with("can") || name.starts_with("vcan")) {
                    return None;
                }
                let link_state = if read_flags(&entry.path()).is_some_and(|f| f & IFF_UP != 0) {
                    LinkState::Up
                } else {
                    LinkState::Down
                };
                Some(InterfaceInfo {
                    kind: InterfaceKind::classify(&name),
                    name,
                    link_state,
                    bitrate: None,
                })
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    #[cfg(feature = "gs_usb")]
    fn from_usb(&self) -> Vec<InterfaceInfo> {
        if !self.include_usb {
            return Vec::new();
        }
        match crate::gs_usb::scan() {
            Ok(devices) => devices
                .iter()
                .map(|d| InterfaceInfo {
                    name: d.interface_name(),
                    kind: InterfaceKind::Vendor,
                    link_state: LinkState::Down,
                    bitrate: None,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("GS-USB scan failed: {}", e);
                Vec::new()
            },
        }
    }

    #[cfg(not(feature = "gs_usb"))]
    fn from_usb(&self) -> Vec<InterfaceInfo> {
        Vec::new()
    }
}

impl Default for SystemEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceEnumerator for SystemEnumerator {
    fn list(&self) -> Vec<InterfaceInfo> {
        let mut system = self.from_ip();
        for info in self.from_sysfs() {
            if !system.iter().any(|known| known.name == info.name) {
                system.push(info);
            }
        }
        system.extend(self.from_usb());
        merge(system)
    }
}

fn read_flags(dir: &Path) -> Option<u32> {
    let raw = fs::read_to_string(dir.join("flags")).ok()?;
    u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

/// 默认接口在前；同名条目只保留一个，发现到的状态覆盖默认值
fn merge(discovered: Vec<InterfaceInfo>) -> Vec<InterfaceInfo> {
    let mut list: Vec<InterfaceInfo> = BASELINE.iter().map(|n| InterfaceInfo::baseline(n)).collect();
    for info in discovered {
        match list.iter_mut().find(|existing| existing.name == info.name) {
            Some(existing) => *existing = info,
            None => list.push(info),
        }
    }
    list
}
