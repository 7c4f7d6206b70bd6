//! 网络接口生命周期
//!
//! - [`InterfaceKind::classify`]：按名称区分虚拟 / 物理 / 厂商接口
//! - [`PrivilegeStrategy`]：直接执行与提权执行两种命令路径，按顺序尝试
//! - [`LinkProbe`]：只读的链路状态查询
//! - [`LifecycleManager`]：按接口名单飞（single-flight）的 bring-up
//! - [`SystemEnumerator`]：候选接口发现

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod discovery;
mod lifecycle;
mod privilege;
mod probe;

pub use discovery::{InterfaceEnumerator, InterfaceInfo, SystemEnumerator};
pub use lifecycle::LifecycleManager;
pub use privilege::{
    CommandOutput, CommandRunner, DirectExec, ElevatedExec, PrivilegeStrategy, SystemRunner,
};
pub use probe::{IpLinkProbe, LinkProbe, LinkStatus};

/// 链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Down,
    Configuring,
    Up,
    Error,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Down => "down",
            LinkState::Configuring => "configuring",
            LinkState::Up => "up",
            LinkState::Error => "error",
        })
    }
}

/// 接口类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Physical,
    Virtual,
    Vendor,
}

impl InterfaceKind {
    /// `vcan*` 为虚拟接口，`gs_usb*` / `gsusb*` 为厂商 USB 适配器，其余视为物理接口
    pub fn classify(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("vcan") {
            InterfaceKind::Virtual
        } else if lower.starts_with("gs_usb") || lower.starts_with("gsusb") {
            InterfaceKind::Vendor
        } else {
            InterfaceKind::Physical
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterfaceKind::Physical => "physical",
            InterfaceKind::Virtual => "virtual",
            InterfaceKind::Vendor => "vendor",
        })
    }
}

/// 生命周期错误
///
/// `DriverRejected` 原样携带驱动/工具的错误输出，不自动重试。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Driver rejected request: {0}")]
    DriverRejected(String),
    #[error("Link management unsupported: {0}")]
    Unsupported(String),
    #[error("Invalid interface name '{0}'")]
    InvalidName(String),
    #[error("IO error: {0}")]
    Io(String),
}

/// 单个链路配置步骤
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStep {
    LoadVcanModule,
    AddVirtual { name: String },
    SetDown { name: String },
    ConfigureCan { name: String, bitrate: u32 },
    SetUp { name: String },
}

impl LinkStep {
    /// 对应的命令行（程序名 + 参数）
    pub fn command(&self) -> (&'static str, Vec<String>) {
        let args = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            LinkStep::LoadVcanModule => ("modprobe", args(&["vcan"])),
            LinkStep::AddVirtual { name } => {
                ("ip", args(&["link", "add", "dev", name, "type", "vcan"]))
            },
            LinkStep::SetDown { name } => ("ip", args(&["link", "set", name, "down"])),
            LinkStep::ConfigureCan { name, bitrate } => (
                "ip",
                args(&["link", "set", name, "type", "can", "bitrate", &bitrate.to_string()]),
            ),
            LinkStep::SetUp { name } => ("ip", args(&["link", "set", name, "up"])),
        }
    }

    /// 失败可以忽略的步骤（模块可能已内建或已加载；链路可能被并发创建）
    pub(crate) fn tolerates(&self, stderr: &str) -> bool {
        match self {
            LinkStep::LoadVcanModule => true,
            LinkStep::AddVirtual { .. } => stderr.contains("File exists"),
            _ => false,
        }
    }
}

/// 接口名只允许 `[A-Za-z0-9_.-]`，长度 1-15（IFNAMSIZ - 1）
///
/// 名称会出现在提权 shell 脚本中，因此必须先校验。
pub fn validate_name(name: &str) -> Result<(), LinkError> {
    let valid = !name.is_empty()
        && name.len() <= 15
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(LinkError::InvalidName(name.to_string()))
    }
}

/// 根据工具的错误输出归类失败原因
pub(crate) fn classify_failure(output: &CommandOutput) -> LinkError {
    let stderr = output.stderr.trim();
    let lower = stderr.to_ascii_lowercase();
    // pkexec: 126 = 认证对话框被取消，127 = 未授权
    if matches!(output.code, Some(126) | Some(127)) && output.program == "pkexec" {
        return LinkError::PermissionDenied(stderr.to_string());
    }
    if lower.contains("operation not permitted")
        || lower.contains("permission denied")
        || lower.contains("not authorized")
    {
        LinkError::PermissionDenied(stderr.to_string())
    } else if lower.contains("cannot find device")
        || lower.contains("does not exist")
        || lower.contains("no such device")
    {
        LinkError::DeviceNotFound(stderr.to_string())
    } else {
        LinkError::DriverRejected(stderr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(program: &str, code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            program: program.to_string(),
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classify_names() {
        assert_eq!(InterfaceKind::classify("vcan0"), InterfaceKind::Virtual);
        assert_eq!(InterfaceKind::classify("can1"), InterfaceKind::Physical);
        assert_eq!(InterfaceKind::classify("slcan0"), InterfaceKind::Physical);
        assert_eq!(InterfaceKind::classify("gs_usb0"), InterfaceKind::Vendor);
        assert_eq!(InterfaceKind::classify("GSUSB1"), InterfaceKind::Vendor);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("vcan0").is_ok());
        assert!(validate_name("can_bus.1-a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("vcan0; rm -rf /").is_err());
        assert!(validate_name("abcdefghijklmnop").is_err());
    }

    #[test]
    fn test_step_commands() {
        let step = LinkStep::ConfigureCan {
            name: "can0".into(),
            bitrate: 500_000,
        };
        let (program, args) = step.command();
        assert_eq!(program, "ip");
        assert_eq!(args.join(" "), "link set can0 type can bitrate 500000");
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(&failed("ip", 2, "RTNETLINK answers: Operation not permitted")),
            LinkError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_failure(&failed("ip", 1, "Cannot find device \"can9\"")),
            LinkError::DeviceNotFound(_)
        ));
        assert_eq!(
            classify_failure(&failed("ip", 2, "RTNETLINK answers: Device or resource busy\n")),
            LinkError::DriverRejected("RTNETLINK answers: Device or resource busy".into())
        );
        assert!(matches!(
            classify_failure(&failed("pkexec", 126, "")),
            LinkError::PermissionDenied(_)
        ));
    }
}
