//! GS-USB 适配器（candleLight / CANable 等 USB-CAN 设备）
//!
//! 接口名 `gs_usb<N>`（或 `gsusb<N>`）对应第 N 个枚举到的设备，省略序号时为 0。
//! 设备在打开时按请求的波特率（默认 250 kbps）配置并启动，关闭时复位。
//! 固件会回显每个成功发送的帧，回显帧以 `Direction::Tx` 交付。

mod device;
mod frame;
mod protocol;

pub use device::{GsUsbDevice, GsUsbDeviceInfo, scan};
pub use protocol::DEFAULT_BITRATE;

use crate::{
    BackendKind, CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, RxAdapter, TxAdapter,
};
use busview_protocol::{BusFrame, Direction};
use frame::GsUsbFrame;
use protocol::{CAN_ERR_BUSOFF, GS_CAN_MODE_NORMAL};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};

/// 从接口名解析设备序号
pub fn parse_device_index(interface: &str) -> Result<usize, CanError> {
    let lower = interface.to_ascii_lowercase();
    let digits = lower
        .strip_prefix("gs_usb")
        .or_else(|| lower.strip_prefix("gsusb"))
        .ok_or_else(|| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::UnsupportedConfig,
                format!("'{}' is not a GS-USB interface name", interface),
            ))
        })?;
    if digits.is_empty() {
        return Ok(0);
    }
    digits.parse().map_err(|_| {
        CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::UnsupportedConfig,
            format!("Invalid GS-USB device index in '{}'", interface),
        ))
    })
}

/// 转换设备帧；普通错误帧与远程帧返回 `Ok(None)`
fn convert_frame(raw: GsUsbFrame) -> Result<Option<BusFrame>, CanError> {
    if raw.is_error_frame() {
        if raw.can_id & CAN_ERR_BUSOFF != 0 {
            error!("CAN Bus Off error detected");
            return Err(CanError::BusOff);
        }
        warn!("CAN error frame received (id 0x{:08X}), ignoring", raw.can_id);
        return Ok(None);
    }
    if raw.has_overflow() {
        warn!("GS-USB RX overflow, frames were lost");
    }
    if raw.is_remote() {
        trace!("Ignoring remote frame 0x{:X}", raw.raw_id());
        return Ok(None);
    }
    if raw.can_dlc > 8 {
        return Err(CanError::Corrupt(format!("Invalid DLC: {} (max 8)", raw.can_dlc)));
    }

    let payload = &raw.data[..raw.can_dlc as usize];
    let frame = if raw.is_extended() {
        BusFrame::new_extended(raw.raw_id(), payload)
    } else {
        BusFrame::new_standard(raw.raw_id() as u16, payload)
    }
    .map_err(|e| CanError::Corrupt(e.to_string()))?;

    let direction = if raw.is_tx_echo() {
        Direction::Tx
    } else {
        Direction::Rx
    };
    Ok(Some(frame.with_direction(direction)))
}

/// 从缓冲或设备取下一帧
///
/// 一个 USB 包可能包含多帧，剩余帧缓存在 `pending` 中。
fn receive_from(
    device: &GsUsbDevice,
    pending: &mut VecDeque<BusFrame>,
    timeout: Duration,
) -> Result<BusFrame, CanError> {
    if let Some(frame) = pending.pop_front() {
        return Ok(frame);
    }
    if !device.is_started() {
        return Err(CanError::NotStarted);
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CanError::Timeout);
        }
        for raw in device.receive_batch(remaining)? {
            if let Some(frame) = convert_frame(raw)? {
                pending.push_back(frame);
            }
        }
        if let Some(frame) = pending.pop_front() {
            return Ok(frame);
        }
    }
}

fn send_to(device: &GsUsbDevice, frame: &BusFrame) -> Result<(), CanError> {
    if !device.is_started() {
        return Err(CanError::NotStarted);
    }
    let raw = GsUsbFrame::outgoing(frame.id(), frame.is_extended(), frame.data_slice());
    device.send_raw(&raw)?;
    trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id(), frame.len());
    Ok(())
}

pub struct GsUsbAdapter {
    interface: String,
    device: Option<Arc<GsUsbDevice>>,
    pending: VecDeque<BusFrame>,
}

impl GsUsbAdapter {
    /// 打开、配置波特率并启动设备
    pub fn open(interface: &str, bitrate: Option<u32>) -> Result<Self, CanError> {
        let index = parse_device_index(interface)?;
        let device = GsUsbDevice::open(index)?;
        let bitrate = bitrate.unwrap_or(DEFAULT_BITRATE);
        device.set_bitrate(bitrate)?;
        device.start(GS_CAN_MODE_NORMAL)?;
        info!("GS-USB interface '{}' started at {} bps", interface, bitrate);

        Ok(Self {
            interface: interface.to_string(),
            device: Some(Arc::new(device)),
            pending: VecDeque::new(),
        })
    }

    fn device(&self) -> Result<&GsUsbDevice, CanError> {
        self.device.as_deref().ok_or(CanError::Closed)
    }
}

impl CanAdapter for GsUsbAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::GsUsb
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        send_to(self.device()?, &frame)
    }

    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        let device = self.device.as_deref().ok_or(CanError::Closed)?;
        receive_from(device, &mut self.pending, timeout)
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            device.stop();
            self.pending.clear();
        }
    }

    fn split(mut self: Box<Self>) -> Result<(Box<dyn RxAdapter>, Box<dyn TxAdapter>), CanError> {
        let device = self.device.take().ok_or(CanError::Closed)?;
        Ok((
            Box::new(GsUsbRx {
                device: Some(Arc::clone(&device)),
                pending: std::mem::take(&mut self.pending),
            }),
            Box::new(GsUsbTx {
                device: Some(device),
            }),
        ))
    }
}

pub struct GsUsbRx {
    device: Option<Arc<GsUsbDevice>>,
    pending: VecDeque<BusFrame>,
}

impl RxAdapter for GsUsbRx {
    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        let device = self.device.as_deref().ok_or(CanError::Closed)?;
        receive_from(device, &mut self.pending, timeout)
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            device.stop();
        }
    }
}

pub struct GsUsbTx {
    device: Option<Arc<GsUsbDevice>>,
}

impl TxAdapter for GsUsbTx {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        send_to(self.device.as_deref().ok_or(CanError::Closed)?, &frame)
    }

    fn close(&mut self) {
        self.device = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{CAN_EFF_FLAG, CAN_ERR_FLAG, GS_USB_RX_ECHO_ID};

    fn raw(echo_id: u32, can_id: u32, dlc: u8) -> GsUsbFrame {
        GsUsbFrame {
            echo_id,
            can_id,
            can_dlc: dlc,
            channel: 0,
            flags: 0,
            data: [0x7D, 0x41, 0, 0, 0, 0, 0, 0],
        }
    }

    #[test]
    fn test_parse_device_index() {
        assert_eq!(parse_device_index("gs_usb0").unwrap(), 0);
        assert_eq!(parse_device_index("gsusb2").unwrap(), 2);
        assert_eq!(parse_device_index("GS_USB").unwrap(), 0);
        assert!(parse_device_index("can0").is_err());
        assert!(parse_device_index("gs_usbX").is_err());
    }

    #[test]
    fn test_convert_rx_and_echo() {
        let rx = convert_frame(raw(GS_USB_RX_ECHO_ID, 0x18FEEE00 | CAN_EFF_FLAG, 2))
            .unwrap()
            .unwrap();
        assert_eq!(rx.direction(), Direction::Rx);
        assert_eq!(rx.id(), 0x18FEEE00);
        assert_eq!(rx.data_slice(), &[0x7D, 0x41]);

        let echo = convert_frame(raw(0, 0x123, 0)).unwrap().unwrap();
        assert_eq!(echo.direction(), Direction::Tx);
        assert!(!echo.is_extended());
    }

    #[test]
    fn test_convert_error_frames() {
        assert!(matches!(
            convert_frame(raw(GS_USB_RX_ECHO_ID, CAN_ERR_FLAG | CAN_ERR_BUSOFF, 8)),
            Err(CanError::BusOff)
        ));
        assert!(matches!(
            convert_frame(raw(GS_USB_RX_ECHO_ID, CAN_ERR_FLAG | 0x04, 8)),
            Ok(None)
        ));
        assert!(matches!(
            convert_frame(raw(GS_USB_RX_ECHO_ID, 0x123, 9)),
            Err(CanError::Corrupt(_))
        ));
    }
}
