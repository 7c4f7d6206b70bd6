//! 驱动层错误类型定义

use crate::state::ConnectionState;
use busview_can::CanError;
use busview_protocol::{CodecError, ProtocolError};
use thiserror::Error;

/// 会话错误
#[derive(Error, Debug)]
pub enum SessionError {
    /// 适配器打开失败（会话保持 `Disconnected`）
    #[error("Connect failed: {0}")]
    Connect(#[source] CanError),

    /// 当前状态不允许该操作
    #[error("Invalid session state: {0}")]
    InvalidState(ConnectionState),

    /// 会话运行期间的读写错误
    #[error("Transport error: {0}")]
    Transport(#[from] CanError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Frame error: {0}")]
    Frame(#[from] ProtocolError),

    /// 发送队列已关闭（断开进行中）
    #[error("Transmit queue closed")]
    ChannelClosed,

    /// 发送队列已满
    #[error("Transmit queue full")]
    ChannelFull,

    /// 发送在 `tx_timeout` 内未完成
    #[error("Transmit timeout")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid PGN definition: {0}")]
    Codec(#[from] CodecError),

    /// PGN 覆盖定义解码参考帧的结果与期望不符
    #[error(
        "PGN {pgn} field '{field}': reference frame decodes to {actual}, expected {expected}"
    )]
    ReferenceMismatch {
        pgn: u32,
        field: String,
        expected: f64,
        actual: String,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 预设存储错误
#[derive(Error, Debug)]
pub enum PresetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed preset document: {0}")]
    Json(#[from] serde_json::Error),
}
