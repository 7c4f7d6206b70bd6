//! GS-USB 协议定义
//!
//! 协议常量、控制请求结构体和位定时求解（只支持 CAN 2.0，不支持 CAN FD）

/// Set bit timing
pub const GS_USB_BREQ_BITTIMING: u8 = 1;
/// Set/start mode
pub const GS_USB_BREQ_MODE: u8 = 2;
/// Get bit timing constants
pub const GS_USB_BREQ_BT_CONST: u8 = 4;

/// Normal operation mode
pub const GS_CAN_MODE_NORMAL: u32 = 0;
/// Listen-only mode (no ACKs sent)
pub const GS_CAN_MODE_LISTEN_ONLY: u32 = 1 << 0;
/// Loopback mode
pub const GS_CAN_MODE_LOOP_BACK: u32 = 1 << 1;

/// Reset/stop mode
pub const GS_CAN_MODE_RESET: u32 = 0;
/// Start mode
pub const GS_CAN_MODE_START: u32 = 1;

/// Extended frame format flag (29-bit ID)
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error message frame flag
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// 错误帧类别：Bus Off
pub const CAN_ERR_BUSOFF: u32 = 0x0000_0040;

/// Echo ID for transmitted frames
pub const GS_USB_ECHO_ID: u32 = 0;
/// Echo ID value for received frames (from CAN bus)
pub const GS_USB_RX_ECHO_ID: u32 = 0xFFFF_FFFF;

/// Classic CAN frame size (without timestamp)
pub const GS_USB_FRAME_SIZE: usize = 20;

/// RX overflow occurred
pub const GS_CAN_FLAG_OVERFLOW: u8 = 1 << 0;

/// USB Control Transfer: Host to Device | Vendor | Interface
pub const GS_USB_REQ_OUT: u8 = 0x41;
/// USB Control Transfer: Device to Host | Vendor | Interface
pub const GS_USB_REQ_IN: u8 = 0xC1;

/// 未指定时使用的波特率
pub const DEFAULT_BITRATE: u32 = 250_000;

/// 已知的 GS-USB 设备 (VID, PID)
pub const KNOWN_DEVICES: &[(u16, u16)] = &[
    (0x1D50, 0x606F), // candleLight / CANable
    (0x1209, 0x2323), // candleLight (pid.codes)
    (0x1CD2, 0x606F), // CES CANext FD
    (0x16D0, 0x10B8), // ABE CANdebugger FD
];

pub fn is_gs_usb_device(vendor_id: u16, product_id: u16) -> bool {
    KNOWN_DEVICES.contains(&(vendor_id, product_id))
}

/// CAN 位定时配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBitTiming {
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    pub sjw: u32,
    pub brp: u32,
}

impl DeviceBitTiming {
    pub fn new(prop_seg: u32, phase_seg1: u32, phase_seg2: u32, sjw: u32, brp: u32) -> Self {
        Self {
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw,
            brp,
        }
    }

    /// Pack into bytes for USB transfer (20 bytes)
    pub fn pack(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.prop_seg.to_le_bytes());
        buf[4..8].copy_from_slice(&self.phase_seg1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.phase_seg2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sjw.to_le_bytes());
        buf[16..20].copy_from_slice(&self.brp.to_le_bytes());
        buf
    }

    /// 每位的时间量子数（含同步段）
    pub fn total_tq(&self) -> u32 {
        1 + self.prop_seg + self.phase_seg1 + self.phase_seg2
    }

    /// 在设备约束内求解位定时，采样点尽量接近 87.5%
    ///
    /// 只接受能整除出目标波特率的组合；无解时返回 `None`。
    pub fn solve(cap: &DeviceCapability, bitrate: u32) -> Option<Self> {
        if bitrate == 0 || cap.fclk_can == 0 {
            return None;
        }
        let brp_inc = cap.brp_inc.max(1);
        let mut best: Option<(u32, Self)> = None;

        let mut brp = cap.brp_min.max(1);
        while brp <= cap.brp_max {
            let divisor = u64::from(brp) * u64::from(bitrate);
            let fclk = u64::from(cap.fclk_can);
            if fclk % divisor == 0 {
                let tq = (fclk / divisor) as u32;
                if let Some(candidate) = Self::split_tq(cap, tq, brp) {
                    // 采样点误差（千分比）
                    let sample = 1000 * (tq - candidate.phase_seg2) / tq;
                    let error = sample.abs_diff(875);
                    if best.as_ref().is_none_or(|(e, _)| error < *e) {
                        best = Some((error, candidate));
                    }
                }
            }
            brp += brp_inc;
        }

        best.map(|(_, timing)| timing)
    }

    fn split_tq(cap: &DeviceCapability, tq: u32, brp: u32) -> Option<Self> {
        if tq < 1 + cap.tseg1_min + cap.tseg2_min || tq > 1 + cap.tseg1_max + cap.tseg2_max {
            return None;
        }
        let tseg2 = (tq / 8).clamp(cap.tseg2_min.max(1), cap.tseg2_max);
        let tseg1 = tq - 1 - tseg2;
        if tseg1 < cap.tseg1_min || tseg1 > cap.tseg1_max {
            return None;
        }
        let prop_seg = tseg1 / 2;
        let sjw = tseg2.min(cap.sjw_max.max(1));
        Some(Self::new(prop_seg, tseg1 - prop_seg, tseg2, sjw, brp))
    }
}

/// 设备模式配置
#[derive(Debug, Clone, Copy)]
pub struct DeviceMode {
    pub mode: u32,
    pub flags: u32,
}

impl DeviceMode {
    pub fn new(mode: u32, flags: u32) -> Self {
        Self { mode, flags }
    }

    /// Pack into bytes for USB transfer (8 bytes)
    pub fn pack(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }
}

/// 设备能力（位定时约束和功能标志）
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCapability {
    pub feature: u32,
    pub fclk_can: u32,
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl DeviceCapability {
    pub const WIRE_SIZE: usize = 40;

    /// Unpack from BT_CONST response (40 bytes)
    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Some(Self {
            feature: word(0),
            fclk_can: word(4),
            tseg1_min: word(8),
            tseg1_max: word(12),
            tseg2_min: word(16),
            tseg2_max: word(20),
            sjw_max: word(24),
            brp_min: word(28),
            brp_max: word(32),
            brp_inc: word(36),
        })
    }
}
