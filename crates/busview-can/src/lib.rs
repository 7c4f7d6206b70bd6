//! # Busview CAN Adapter Layer
//!
//! CAN 硬件抽象层：在多个后端之上提供统一的 open / receive_one / send / close 契约，
//! 并负责 Linux 网络接口的生命周期（创建、配置、启动）。
//!
//! 后端类型只在本 crate 的 [`open`] 中分支，上层永远只看到 `dyn CanAdapter`。

use busview_protocol::BusFrame;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub mod link;
pub mod loopback;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(feature = "gs_usb")]
pub mod gs_usb;

pub use link::{
    InterfaceEnumerator, InterfaceInfo, InterfaceKind, LifecycleManager, LinkError, LinkState,
    LinkStatus, SystemEnumerator,
};
pub use loopback::LoopbackAdapter;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

#[cfg(feature = "gs_usb")]
pub use gs_usb::GsUsbAdapter;

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    /// 驱动返回了截断或格式错误的帧
    #[error("Corrupt frame: {0}")]
    Corrupt(String),
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
    #[error("Adapter closed")]
    Closed,
    #[error("Backend unsupported: {0}")]
    Unsupported(String),
}

impl CanError {
    /// 接收循环遇到此错误时是否应终止会话
    ///
    /// `Timeout` 是正常的轮询结果；`Corrupt` 只影响单帧；设备忙可重试。
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::Timeout | CanError::Corrupt(_) => false,
            CanError::Device(e) => e.kind != CanDeviceErrorKind::Busy,
            _ => true,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    Busy,
    UnsupportedConfig,
    InvalidResponse,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NoDevice
                | CanDeviceErrorKind::AccessDenied
                | CanDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Linux 内核 SocketCAN
    #[default]
    #[serde(rename = "socketcan")]
    SocketCan,
    /// GS-USB 协议 USB 适配器（candleLight 等）
    GsUsb,
    /// 进程内虚拟总线（所有平台可用）
    Loopback,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::SocketCan => "socketcan",
            BackendKind::GsUsb => "gs_usb",
            BackendKind::Loopback => "loopback",
        }
    }

    /// 按接口名推断默认后端
    pub fn for_interface(name: &str) -> Self {
        match InterfaceKind::classify(name) {
            InterfaceKind::Vendor => BackendKind::GsUsb,
            _ if cfg!(target_os = "linux") => BackendKind::SocketCan,
            _ => BackendKind::Loopback,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socketcan" => Ok(BackendKind::SocketCan),
            "gs_usb" | "gsusb" | "gs-usb" => Ok(BackendKind::GsUsb),
            "loopback" | "virtual" => Ok(BackendKind::Loopback),
            other => Err(CanError::Unsupported(format!("unknown backend '{}'", other))),
        }
    }
}

/// 统一适配器契约
///
/// - `receive_one` 带超时，超时返回 `CanError::Timeout`
/// - 同一句柄同一时间只能有一个 `send` 在进行（由会话层串行化，适配器本身不加锁）
/// - `close` 幂等，关闭后的操作返回 `CanError::Closed`
/// - 本端发送的帧如果出现在接收路径上，方向标记为 `Direction::Tx`
pub trait CanAdapter: Send {
    fn kind(&self) -> BackendKind;
    fn interface(&self) -> &str;
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError>;
    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError>;
    fn close(&mut self);

    /// 分离为独立的 RX 和 TX 适配器，用于双线程模式
    fn split(self: Box<Self>) -> Result<(Box<dyn RxAdapter>, Box<dyn TxAdapter>), CanError>;
}

pub trait RxAdapter: Send {
    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError>;
    fn close(&mut self) {}
}

pub trait TxAdapter: Send {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError>;
    fn close(&mut self) {}
}

/// 打开指定后端上的接口
///
/// 对没有显式波特率概念的后端（波特率在外部预先配置），`bitrate` 仅作参考。
pub fn open(
    interface: &str,
    backend: BackendKind,
    bitrate: Option<u32>,
) -> Result<Box<dyn CanAdapter>, CanError> {
    tracing::debug!(
        "Opening '{}' on {} backend (bitrate: {:?})",
        interface,
        backend,
        bitrate
    );
    match backend {
        BackendKind::Loopback => Ok(Box::new(LoopbackAdapter::attach(interface))),
        BackendKind::SocketCan => open_socketcan(interface),
        BackendKind::GsUsb => open_gs_usb(interface, bitrate),
    }
}

#[cfg(target_os = "linux")]
fn open_socketcan(interface: &str) -> Result<Box<dyn CanAdapter>, CanError> {
    Ok(Box::new(SocketCanAdapter::new(interface)?))
}

#[cfg(not(target_os = "linux"))]
fn open_socketcan(_interface: &str) -> Result<Box<dyn CanAdapter>, CanError> {
    Err(CanError::Unsupported(
        "SocketCAN is only available on Linux".to_string(),
    ))
}

#[cfg(feature = "gs_usb")]
fn open_gs_usb(interface: &str, bitrate: Option<u32>) -> Result<Box<dyn CanAdapter>, CanError> {
    Ok(Box::new(GsUsbAdapter::open(interface, bitrate)?))
}

#[cfg(not(feature = "gs_usb"))]
fn open_gs_usb(_interface: &str, _bitrate: Option<u32>) -> Result<Box<dyn CanAdapter>, CanError> {
    Err(CanError::Unsupported(
        "built without the `gs_usb` feature".to_string(),
    ))
}
