//! # Busview Protocol
//!
//! CAN 帧模型与 J1939 参数组（PGN）编解码（无硬件依赖）
//!
//! ## 模块
//!
//! - `frame`: 不可变的 CAN 2.0 帧值类型 `BusFrame`
//! - `j1939`: 29-bit J1939 标识符位域（优先级 / PGN / 源地址）
//! - `codec`: PGN 定义表与单帧编解码
//! - `builtin`: 内置 PGN 定义
//!
//! ## 字节序
//!
//! J1939 多字节字段使用 Intel（LSB）低位在前（小端字节序）。

pub mod builtin;
pub mod codec;
pub mod frame;
pub mod j1939;

pub use codec::{
    CodecError, CodecRegistry, Decoded, FieldDef, FieldValue, FieldWidth, PgnDefinition,
    PgnSelector, Truncation,
};
pub use frame::{BusFrame, Direction, PAD_BYTE, monotonic_seconds, parse_payload_hex};
pub use j1939::J1939Id;

use thiserror::Error;

/// 帧构建 / 解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid data length: {len} (max 8)")]
    InvalidLength { len: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidId { id: u32 },

    #[error("Invalid hex '{input}': {reason}")]
    InvalidHex { input: String, reason: String },
}
