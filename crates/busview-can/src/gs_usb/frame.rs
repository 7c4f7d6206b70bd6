//! GS-USB host frame 编解码
//!
//! ```text
//! echo_id: u32 LE | can_id: u32 LE | dlc | channel | flags | reserved | data[8]
//! ```

use super::protocol::*;
use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsUsbFrame {
    pub echo_id: u32,
    /// 含 EFF/RTR/ERR 标志位
    pub can_id: u32,
    pub can_dlc: u8,
    pub channel: u8,
    pub flags: u8,
    pub data: [u8; 8],
}

impl GsUsbFrame {
    /// 构造待发送帧（echo_id = 0，设备发送成功后会回显）
    pub fn outgoing(id: u32, is_extended: bool, payload: &[u8]) -> Self {
        let mut data = [0u8; 8];
        let len = payload.len().min(8);
        data[..len].copy_from_slice(&payload[..len]);
        let can_id = if is_extended {
            (id & CAN_EFF_MASK) | CAN_EFF_FLAG
        } else {
            id & CAN_SFF_MASK
        };
        Self {
            echo_id: GS_USB_ECHO_ID,
            can_id,
            can_dlc: len as u8,
            channel: 0,
            flags: 0,
            data,
        }
    }

    pub fn pack_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.echo_id);
        buf.put_u32_le(self.can_id);
        buf.put_u8(self.can_dlc);
        buf.put_u8(self.channel);
        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_slice(&self.data);
    }

    /// 解析一个 20 字节帧；长度不足时返回 `None`
    pub fn unpack(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < GS_USB_FRAME_SIZE {
            return None;
        }
        let echo_id = raw.get_u32_le();
        let can_id = raw.get_u32_le();
        let can_dlc = raw.get_u8();
        let channel = raw.get_u8();
        let flags = raw.get_u8();
        raw.advance(1);
        let mut data = [0u8; 8];
        raw.copy_to_slice(&mut data);
        Some(Self {
            echo_id,
            can_id,
            can_dlc,
            channel,
            flags,
            data,
        })
    }

    /// 设备对本端发送帧的回显
    pub fn is_tx_echo(&self) -> bool {
        self.echo_id != GS_USB_RX_ECHO_ID
    }

    pub fn is_extended(&self) -> bool {
        self.can_id & CAN_EFF_FLAG != 0
    }

    pub fn is_error_frame(&self) -> bool {
        self.can_id & CAN_ERR_FLAG != 0
    }

    pub fn is_remote(&self) -> bool {
        self.can_id & CAN_RTR_FLAG != 0
    }

    pub fn has_overflow(&self) -> bool {
        self.flags & GS_CAN_FLAG_OVERFLOW != 0
    }

    pub fn raw_id(&self) -> u32 {
        if self.is_extended() {
            self.can_id & CAN_EFF_MASK
        } else {
            self.can_id & CAN_SFF_MASK
        }
    }
}
