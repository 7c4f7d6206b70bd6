//! CAN 2.0 帧值类型
//!
//! `BusFrame` 是协议层与硬件层之间的统一抽象，一经构建即不可变：
//! 修改时间戳或方向都返回新的副本。

use crate::ProtocolError;
use std::sync::OnceLock;
use std::time::Instant;

/// 未使用数据字节的填充值（J1939 "不可用"哨兵值，而非 0）
pub const PAD_BYTE: u8 = 0xFF;

/// 标准帧 ID 上限（11-bit）
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// 扩展帧 ID 上限（29-bit）
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 进程级单调时钟（秒）
///
/// 第一次调用时确定纪元，之后返回相对该纪元的秒数。
pub fn monotonic_seconds() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 帧方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Direction {
    /// 从总线接收
    #[default]
    Rx,
    /// 本端发送（回环或发送确认）
    Tx,
}

/// 不可变 CAN 2.0 帧
///
/// - 固定 8 字节数据，未使用部分填充 [`PAD_BYTE`]
/// - `timestamp` 为单调时钟秒数（见 [`monotonic_seconds`]）
/// - `Copy`，适合在接收线程与订阅者之间零成本传递
///
/// ```rust
/// use busview_protocol::{BusFrame, Direction};
///
/// let frame = BusFrame::new_extended(0x18FEEEFF, &[0x7D]).unwrap();
/// assert_eq!(frame.data(), &[0x7D, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
/// assert_eq!(frame.len(), 1);
/// assert_eq!(frame.direction(), Direction::Rx);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusFrame {
    id: u32,
    data: [u8; 8],
    len: u8,
    is_extended: bool,
    timestamp: f64,
    direction: Direction,
}

impl BusFrame {
    /// 创建标准帧（11-bit ID）
    pub fn new_standard(id: u16, data: &[u8]) -> Result<Self, ProtocolError> {
        if u32::from(id) > MAX_STANDARD_ID {
            return Err(ProtocolError::InvalidId { id: u32::from(id) });
        }
        Self::build(u32::from(id), data, false)
    }

    /// 创建扩展帧（29-bit ID）
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        if id > MAX_EXTENDED_ID {
            return Err(ProtocolError::InvalidId { id });
        }
        Self::build(id, data, true)
    }

    /// 按 ID 大小自动选择帧格式
    pub fn new(id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        if id > MAX_STANDARD_ID {
            Self::new_extended(id, data)
        } else {
            Self::build(id, data, false)
        }
    }

    /// 从十六进制字符串构建帧
    ///
    /// - `id_hex`: 可带 `0x` 前缀；超过 3 个十六进制位或数值大于 0x7FF 时视为扩展帧
    /// - `payload_hex`: 0-16 个十六进制字符，允许空白分隔
    pub fn from_hex(id_hex: &str, payload_hex: &str) -> Result<Self, ProtocolError> {
        let digits = strip_hex_prefix(id_hex.trim());
        let id = u32::from_str_radix(digits, 16).map_err(|e| ProtocolError::InvalidHex {
            input: id_hex.to_string(),
            reason: e.to_string(),
        })?;
        let payload = parse_payload_hex(payload_hex)?;

        if digits.len() > 3 || id > MAX_STANDARD_ID {
            Self::new_extended(id, &payload)
        } else {
            Self::build(id, &payload, false)
        }
    }

    fn build(id: u32, data: &[u8], is_extended: bool) -> Result<Self, ProtocolError> {
        if data.len() > 8 {
            return Err(ProtocolError::InvalidLength { len: data.len() });
        }
        let mut fixed = [PAD_BYTE; 8];
        fixed[..data.len()].copy_from_slice(data);

        Ok(Self {
            id,
            data: fixed,
            len: data.len() as u8,
            is_extended,
            timestamp: 0.0,
            direction: Direction::Rx,
        })
    }

    /// 返回带新时间戳的副本
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 返回带当前单调时间戳的副本
    #[must_use]
    pub fn stamped_now(self) -> Self {
        self.with_timestamp(monotonic_seconds())
    }

    /// 返回带新方向的副本
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 完整 8 字节数据（含填充）
    pub fn data(&self) -> &[u8; 8] {
        &self.data
    }

    /// 有效数据切片
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 数据长度码（0-8）
    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 大写十六进制 ID（扩展帧 8 位，标准帧 3 位）
    pub fn id_hex(&self) -> String {
        if self.is_extended {
            format!("{:08X}", self.id)
        } else {
            format!("{:03X}", self.id)
        }
    }

    /// 有效数据的大写十六进制
    pub fn payload_hex(&self) -> String {
        hex::encode_upper(self.data_slice())
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// 解析负载十六进制字符串（忽略空白，最多 8 字节）
pub fn parse_payload_hex(payload_hex: &str) -> Result<Vec<u8>, ProtocolError> {
    let compact: String = payload_hex.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(strip_hex_prefix(&compact)).map_err(|e| ProtocolError::InvalidHex {
        input: payload_hex.to_string(),
        reason: e.to_string(),
    })?;
    if bytes.len() > 8 {
        return Err(ProtocolError::InvalidLength { len: bytes.len() });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unused_tail_is_padded_with_sentinel() {
        let frame = BusFrame::new_standard(0x123, &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(frame.data_slice(), &[1, 2, 3]);
        assert!(!frame.is_extended());
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let err = BusFrame::new_extended(0x18FEEEFF, &[0; 9]).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidLength { len: 9 });
    }

    #[test]
    fn test_rejects_out_of_range_ids() {
        assert!(BusFrame::new_standard(0x800, &[]).is_err());
        assert!(BusFrame::new_extended(0x2000_0000, &[]).is_err());
    }

    #[test]
    fn test_from_hex_extended() {
        let frame = BusFrame::from_hex("18F11CEF", "A55A55A55A55A55A").unwrap();
        assert!(frame.is_extended());
        assert_eq!(frame.id(), 0x18F1_1CEF);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.id_hex(), "18F11CEF");
        assert_eq!(frame.payload_hex(), "A55A55A55A55A55A");
    }

    #[test]
    fn test_from_hex_short_id_is_standard() {
        let frame = BusFrame::from_hex("0x123", "01 02").unwrap();
        assert!(!frame.is_extended());
        assert_eq!(frame.id_hex(), "123");
        assert_eq!(frame.data_slice(), &[1, 2]);
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(matches!(
            BusFrame::from_hex("XYZ", "00"),
            Err(ProtocolError::InvalidHex { .. })
        ));
        assert!(matches!(
            BusFrame::from_hex("123", "0"),
            Err(ProtocolError::InvalidHex { .. })
        ));
        assert!(matches!(
            BusFrame::from_hex("123", "000000000000000000"),
            Err(ProtocolError::InvalidLength { len: 9 })
        ));
    }

    #[test]
    fn test_copies_are_independent() {
        let frame = BusFrame::new_standard(0x10, &[]).unwrap();
        let stamped = frame.with_timestamp(1.5).with_direction(Direction::Tx);
        assert_eq!(frame.timestamp(), 0.0);
        assert_eq!(frame.direction(), Direction::Rx);
        assert_eq!(stamped.timestamp(), 1.5);
        assert_eq!(stamped.direction(), Direction::Tx);
    }

    #[test]
    fn test_monotonic_seconds_never_decreases() {
        let a = monotonic_seconds();
        let b = monotonic_seconds();
        assert!(b >= a);
    }
}
