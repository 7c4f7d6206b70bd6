//! GS-USB 设备操作
//!
//! USB 设备扫描、接口声明、控制请求与批量传输

use super::frame::GsUsbFrame;
use super::protocol::*;
use crate::{CanDeviceError, CanDeviceErrorKind, CanError};
use bytes::BytesMut;
use rusb::{DeviceHandle, GlobalContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// 单个 USB Bulk 包的读取缓冲（可容纳 200+ 帧）
const BULK_BUFFER_SIZE: usize = 4096;

pub(crate) fn map_usb_error(context: &str, e: rusb::Error) -> CanError {
    let kind = match e {
        rusb::Error::Timeout => return CanError::Timeout,
        rusb::Error::NoDevice => CanDeviceErrorKind::NoDevice,
        rusb::Error::Access => CanDeviceErrorKind::AccessDenied,
        rusb::Error::NotFound => CanDeviceErrorKind::NotFound,
        rusb::Error::Busy => CanDeviceErrorKind::Busy,
        _ => CanDeviceErrorKind::Backend,
    };
    CanError::Device(CanDeviceError::new(kind, format!("{}: {}", context, e)))
}

/// 已连接 GS-USB 设备的摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsUsbDeviceInfo {
    /// 枚举顺序，对应接口名 `gs_usb<index>`
    pub index: usize,
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl GsUsbDeviceInfo {
    pub fn interface_name(&self) -> String {
        format!("gs_usb{}", self.index)
    }
}

/// 列出系统中的 GS-USB 设备（不打开设备）
pub fn scan() -> Result<Vec<GsUsbDeviceInfo>, CanError> {
    let devices = rusb::devices().map_err(|e| map_usb_error("USB enumeration failed", e))?;
    let mut found = Vec::new();
    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if is_gs_usb_device(desc.vendor_id(), desc.product_id()) {
            found.push(GsUsbDeviceInfo {
                index: found.len(),
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }
    }
    Ok(found)
}

/// GS-USB 设备句柄
///
/// `DeviceHandle` 是 `Sync` 的，RX/TX 两个线程可以通过 `Arc` 并发做批量传输。
pub struct GsUsbDevice {
    handle: DeviceHandle<GlobalContext>,
    interface_number: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    started: AtomicBool,
}

impl GsUsbDevice {
    /// 打开第 `index` 个 GS-USB 设备并声明接口
    pub fn open(index: usize) -> Result<Self, CanError> {
        let devices = rusb::devices().map_err(|e| map_usb_error("USB enumeration failed", e))?;
        let device = devices
            .iter()
            .filter(|d| {
                d.device_descriptor()
                    .map(|desc| is_gs_usb_device(desc.vendor_id(), desc.product_id()))
                    .unwrap_or(false)
            })
            .nth(index)
            .ok_or_else(|| {
                CanError::Device(CanDeviceError::new(
                    CanDeviceErrorKind::NotFound,
                    format!("GS-USB device #{} not found", index),
                ))
            })?;

        let config = device
            .config_descriptor(0)
            .map_err(|e| map_usb_error("Failed to read config descriptor", e))?;
        let (endpoint_in, endpoint_out) = config
            .interfaces()
            .next()
            .and_then(|iface| iface.descriptors().next())
            .and_then(|iface| find_bulk_endpoints(&iface))
            .ok_or_else(|| {
                CanError::Device(CanDeviceError::new(
                    CanDeviceErrorKind::InvalidResponse,
                    "GS-USB device has no bulk endpoints",
                ))
            })?;

        let handle = device
            .open()
            .map_err(|e| map_usb_error("Failed to open GS-USB device", e))?;

        let device = Self {
            handle,
            interface_number: 0,
            endpoint_in,
            endpoint_out,
            started: AtomicBool::new(false),
        };
        device.prepare_interface()?;
        Ok(device)
    }

    fn prepare_interface(&self) -> Result<(), CanError> {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if self.handle.kernel_driver_active(self.interface_number).unwrap_or(false) {
                self.handle
                    .detach_kernel_driver(self.interface_number)
                    .map_err(|e| map_usb_error("Failed to detach kernel driver", e))?;
            }
        }

        self.handle
            .claim_interface(self.interface_number)
            .map_err(|e| map_usb_error("Failed to claim interface", e))?;

        // 清除上次异常退出残留的 Halt 状态与 Data Toggle
        for endpoint in [self.endpoint_in, self.endpoint_out] {
            if let Err(e) = self.handle.clear_halt(endpoint) {
                trace!("Failed to clear halt on endpoint 0x{:02X}: {}", endpoint, e);
            }
        }
        Ok(())
    }

    pub fn device_capability(&self) -> Result<DeviceCapability, CanError> {
        let mut buf = [0u8; DeviceCapability::WIRE_SIZE];
        let len = self
            .handle
            .read_control(
                GS_USB_REQ_IN,
                GS_USB_BREQ_BT_CONST,
                0,
                u16::from(self.interface_number),
                &mut buf,
                CONTROL_TIMEOUT,
            )
            .map_err(|e| map_usb_error("BT_CONST request failed", e))?;

        DeviceCapability::unpack(&buf[..len]).ok_or_else(|| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::InvalidResponse,
                format!(
                    "BT_CONST response too short: {} bytes (expected {})",
                    len,
                    DeviceCapability::WIRE_SIZE
                ),
            ))
        })
    }

    pub fn set_bitrate(&self, bitrate: u32) -> Result<(), CanError> {
        let cap = self.device_capability()?;
        let timing = DeviceBitTiming::solve(&cap, bitrate).ok_or_else(|| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::UnsupportedConfig,
                format!(
                    "Unsupported bitrate {} for clock {} Hz",
                    bitrate, cap.fclk_can
                ),
            ))
        })?;
        trace!("GS-USB bit timing for {} bps: {:?}", bitrate, timing);
        self.control_out(GS_USB_BREQ_BITTIMING, &timing.pack())
    }

    pub fn start(&self, flags: u32) -> Result<(), CanError> {
        let flags = flags & (GS_CAN_MODE_LISTEN_ONLY | GS_CAN_MODE_LOOP_BACK);
        self.control_out(
            GS_USB_BREQ_MODE,
            &DeviceMode::new(GS_CAN_MODE_START, flags).pack(),
        )?;
        self.started.store(true, Ordering::Release);
        trace!("GS-USB device started with flags: 0x{:08x}", flags);
        Ok(())
    }

    /// 停止设备（幂等）
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            let mode = DeviceMode::new(GS_CAN_MODE_RESET, 0);
            if let Err(e) = self.control_out(GS_USB_BREQ_MODE, &mode.pack()) {
                trace!("GS-USB stop request failed (device may be gone): {}", e);
            }
            trace!("GS-USB device stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 发送一帧；超时后清除端点 Halt 以恢复设备
    pub fn send_raw(&self, frame: &GsUsbFrame) -> Result<(), CanError> {
        let mut buf = BytesMut::with_capacity(GS_USB_FRAME_SIZE);
        frame.pack_to(&mut buf);

        match self.handle.write_bulk(self.endpoint_out, &buf, WRITE_TIMEOUT) {
            Ok(_) => Ok(()),
            Err(rusb::Error::Timeout) => {
                if let Err(e) = self.handle.clear_halt(self.endpoint_out) {
                    warn!("Failed to clear endpoint halt after timeout: {}", e);
                }
                Err(CanError::Device(CanDeviceError::new(
                    CanDeviceErrorKind::Busy,
                    "GS-USB write timeout",
                )))
            },
            Err(e) => Err(map_usb_error("Bulk write failed", e)),
        }
    }

    /// 读取一个 USB Bulk 包并解析其中所有完整帧
    pub fn receive_batch(&self, timeout: Duration) -> Result<Vec<GsUsbFrame>, CanError> {
        let mut buf = vec![0u8; BULK_BUFFER_SIZE];
        let len = self
            .handle
            .read_bulk(self.endpoint_in, &mut buf, timeout)
            .map_err(|e| map_usb_error("Bulk read failed", e))?;

        if len % GS_USB_FRAME_SIZE != 0 {
            warn!(
                "USB packet contains incomplete frame: {} bytes (expected multiple of {})",
                len, GS_USB_FRAME_SIZE
            );
        }

        Ok(buf[..len]
            .chunks_exact(GS_USB_FRAME_SIZE)
            .filter_map(GsUsbFrame::unpack)
            .collect())
    }

    fn control_out(&self, request: u8, data: &[u8]) -> Result<(), CanError> {
        self.handle
            .write_control(
                GS_USB_REQ_OUT,
                request,
                0,
                u16::from(self.interface_number),
                data,
                CONTROL_TIMEOUT,
            )
            .map_err(|e| map_usb_error("Control transfer failed", e))?;
        Ok(())
    }
}

impl Drop for GsUsbDevice {
    fn drop(&mut self) {
        self.stop();
        let _ = self.handle.release_interface(self.interface_number);
        trace!("[Release] USB Interface released");
    }
}

fn find_bulk_endpoints(interface: &rusb::InterfaceDescriptor) -> Option<(u8, u8)> {
    let mut endpoint_in = None;
    let mut endpoint_out = None;

    for endpoint in interface.endpoint_descriptors() {
        if endpoint.transfer_type() == rusb::TransferType::Bulk {
            if endpoint.direction() == rusb::Direction::In {
                endpoint_in = Some(endpoint.address());
            } else {
                endpoint_out = Some(endpoint.address());
            }
        }
    }

    endpoint_in.zip(endpoint_out)
}
