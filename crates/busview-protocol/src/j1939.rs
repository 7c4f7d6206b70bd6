//! J1939 29-bit 标识符
//!
//! ```text
//! bit 28..26  priority
//! bit 25      extended data page (EDP)
//! bit 24      data page (DP)
//! bit 23..16  PDU format (PF)
//! bit 15..8   PDU specific (PS)：PF < 240 时为目标地址，否则为组扩展
//! bit 7..0    source address (SA)
//! ```
//!
//! bilge 默认 LSB first 位序，字段按从低位到高位的顺序声明。

use bilge::prelude::*;

/// PF 小于该值为 PDU1（点对点），PS 是目标地址而非 PGN 的一部分
pub const PDU2_THRESHOLD: u8 = 240;

/// J1939 全局目标地址
pub const GLOBAL_ADDRESS: u8 = 0xFF;

/// J1939 空地址（未声明地址的节点）
pub const NULL_ADDRESS: u8 = 0xFE;

/// 默认优先级（信息类报文）
pub const DEFAULT_PRIORITY: u8 = 6;

#[bitsize(29)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq)]
pub struct J1939Id {
    pub source_address: u8,
    pub pdu_specific: u8,
    pub pdu_format: u8,
    pub data_page: bool,
    pub extended_data_page: bool,
    pub priority: u3,
}

impl J1939Id {
    /// 从原始扩展 ID 解析（高 3 位被忽略）
    pub fn from_raw(id: u32) -> Self {
        J1939Id::from(u29::new(id & 0x1FFF_FFFF))
    }

    /// 由优先级、PGN 与源地址组装
    ///
    /// PDU1 格式的 PGN 以全局地址（0xFF）作为目标地址。
    pub fn compose(priority: u8, pgn: u32, source_address: u8) -> Self {
        let pdu_format = ((pgn >> 8) & 0xFF) as u8;
        let pdu_specific = if pdu_format < PDU2_THRESHOLD {
            GLOBAL_ADDRESS
        } else {
            (pgn & 0xFF) as u8
        };
        J1939Id::new(
            source_address,
            pdu_specific,
            pdu_format,
            pgn & 0x1_0000 != 0,
            pgn & 0x2_0000 != 0,
            u3::new(priority.min(7)),
        )
    }

    /// 原始 29-bit 值
    pub fn raw(self) -> u32 {
        u29::from(self).value()
    }

    /// 参数组号（18-bit：EDP | DP | PF | PS-if-PDU2）
    pub fn pgn(self) -> u32 {
        let page = (u32::from(self.extended_data_page()) << 17) | (u32::from(self.data_page()) << 16);
        let pf = u32::from(self.pdu_format());
        if self.pdu_format() >= PDU2_THRESHOLD {
            page | (pf << 8) | u32::from(self.pdu_specific())
        } else {
            page | (pf << 8)
        }
    }

    /// PDU1 报文的目标地址
    pub fn destination_address(self) -> Option<u8> {
        (self.pdu_format() < PDU2_THRESHOLD).then(|| self.pdu_specific())
    }
}
