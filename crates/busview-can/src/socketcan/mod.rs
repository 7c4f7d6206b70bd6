//! SocketCAN CAN 适配器实现
//!
//! 基于 Linux 内核 SocketCAN 子系统。
//!
//! ## 特性
//!
//! - 支持标准帧和扩展帧
//! - 打开时启用 `CAN_RAW_RECV_OWN_MSGS`，本端发送的帧经 `MSG_CONFIRM` 识别后标记为 `Direction::Tx`
//! - 自动过滤错误帧，Bus Off 与控制器溢出除外
//!
//! ## 限制
//!
//! - 波特率由 `ip link` 在外部配置（见 [`crate::link`]），打开时接口必须已处于 UP 状态

use crate::{
    BackendKind, CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, RxAdapter, TxAdapter,
};
use busview_protocol::{BusFrame, Direction};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{MsgFlags, SockaddrStorage, recvmsg};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Socket, StandardId};
use std::io::IoSliceMut;
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{error, trace, warn};

mod interface_check;

use interface_check::check_interface_status;

const CAN_FRAME_LEN: usize = std::mem::size_of::<libc::can_frame>();

// linux/can/error.h
const CAN_ERR_CRTL: u32 = 0x0000_0004;
const CAN_ERR_BUSOFF: u32 = 0x0000_0040;
const CAN_ERR_CRTL_RX_OVERFLOW: u8 = 0x01;
const CAN_ERR_CRTL_TX_OVERFLOW: u8 = 0x02;

/// 发送超时（内核发送队列满时）
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// SocketCAN 适配器
///
/// ```no_run
/// use busview_can::{CanAdapter, SocketCanAdapter};
/// use busview_protocol::BusFrame;
/// use std::time::Duration;
///
/// let mut adapter = SocketCanAdapter::new("vcan0").unwrap();
/// adapter.send(BusFrame::new_standard(0x123, &[1, 2, 3, 4]).unwrap()).unwrap();
/// let frame = adapter.receive_one(Duration::from_millis(20)).unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    /// `None` 表示已关闭
    socket: Option<CanSocket>,
    interface: String,
}

impl SocketCanAdapter {
    /// 打开 SocketCAN 接口
    ///
    /// 打开前检查接口是否存在且为 UP 状态。
    ///
    /// # 错误
    /// - `CanError::Device`: 接口不存在、未启动或无法打开
    /// - `CanError::Io`: 系统调用失败
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        if !check_interface_status(&interface)? {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NotFound,
                format!(
                    "CAN interface '{}' exists but is not UP. Please start it first:\n  sudo ip link set up {}",
                    interface, interface
                ),
            )));
        }

        let socket = CanSocket::open(&interface).map_err(|e| {
            CanError::Device(format!("Failed to open CAN interface '{}': {}", interface, e).into())
        })?;

        // 接收本端发送的帧，通过 MSG_CONFIRM 与外部帧区分
        let enabled: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_RECV_OWN_MSGS,
                &enabled as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!(
                "Failed to enable CAN_RAW_RECV_OWN_MSGS on '{}': {}",
                interface,
                std::io::Error::last_os_error()
            );
        }

        // 订阅 Bus Off 与控制器错误帧
        let err_mask: libc::can_err_mask_t = CAN_ERR_BUSOFF | CAN_ERR_CRTL;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_ERR_FILTER,
                &err_mask as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::can_err_mask_t>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!(
                "Failed to set CAN_RAW_ERR_FILTER on '{}': {}",
                interface,
                std::io::Error::last_os_error()
            );
        }

        socket.set_write_timeout(WRITE_TIMEOUT).map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);
        Ok(Self {
            socket: Some(socket),
            interface,
        })
    }

    fn socket(&self) -> Result<&CanSocket, CanError> {
        self.socket.as_ref().ok_or(CanError::Closed)
    }
}

/// poll + recvmsg 接收一个数据帧
///
/// 普通错误帧被跳过；剩余超时不会因跳过而重置。
fn receive_frame(socket: &CanSocket, timeout: Duration) -> Result<BusFrame, CanError> {
    let deadline = std::time::Instant::now() + timeout;
    let fd = socket.as_raw_fd();

    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let pollfd = PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN);
        let timeout_ms = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
        match poll(&mut [pollfd], PollTimeout::from(timeout_ms)) {
            Ok(0) => return Err(CanError::Timeout),
            Ok(_) => {},
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                return Err(CanError::Io(std::io::Error::other(format!(
                    "poll failed: {}",
                    e
                ))));
            },
        }

        let mut frame_buf = [0u8; CAN_FRAME_LEN];
        let mut iov = [IoSliceMut::new(&mut frame_buf)];
        let (bytes, flags) =
            match recvmsg::<SockaddrStorage>(fd, &mut iov, None, MsgFlags::empty()) {
                Ok(msg) => (msg.bytes, msg.flags),
                Err(nix::errno::Errno::EAGAIN) => return Err(CanError::Timeout),
                Err(e) => {
                    return Err(CanError::Io(std::io::Error::other(format!(
                        "recvmsg failed: {}",
                        e
                    ))));
                },
            };

        let confirmed = flags.bits() & libc::MSG_CONFIRM != 0;
        match parse_raw_can_frame(&frame_buf[..bytes])? {
            RawFrame::Data(frame) => {
                let direction = if confirmed {
                    Direction::Tx
                } else {
                    Direction::Rx
                };
                return Ok(frame.with_direction(direction));
            },
            RawFrame::BusOff => {
                error!("CAN Bus Off error detected");
                return Err(CanError::BusOff);
            },
            RawFrame::Overflow => {
                error!("CAN controller buffer overflow detected");
                return Err(CanError::BufferOverflow);
            },
            RawFrame::OtherError(class) => {
                warn!("CAN error frame received (class 0x{:X}), ignoring", class);
            },
        }
    }
}

enum RawFrame {
    Data(BusFrame),
    BusOff,
    Overflow,
    OtherError(u32),
}

/// 解析 `libc::can_frame` 的字节表示
fn parse_raw_can_frame(data: &[u8]) -> Result<RawFrame, CanError> {
    if data.len() < CAN_FRAME_LEN {
        return Err(CanError::Corrupt(format!(
            "Incomplete CAN frame: {} bytes (expected {})",
            data.len(),
            CAN_FRAME_LEN
        )));
    }

    // 拷贝到对齐的结构体，避免未对齐指针强转
    let mut raw: libc::can_frame = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            &mut raw as *mut _ as *mut u8,
            CAN_FRAME_LEN,
        );
    }

    let can_id = raw.can_id;
    if can_id & libc::CAN_ERR_FLAG != 0 {
        let class = can_id & libc::CAN_ERR_MASK;
        if class & CAN_ERR_BUSOFF != 0 {
            return Ok(RawFrame::BusOff);
        }
        if class & CAN_ERR_CRTL != 0
            && raw.data[1] & (CAN_ERR_CRTL_RX_OVERFLOW | CAN_ERR_CRTL_TX_OVERFLOW) != 0
        {
            return Ok(RawFrame::Overflow);
        }
        return Ok(RawFrame::OtherError(class));
    }

    if can_id & libc::CAN_RTR_FLAG != 0 {
        return Err(CanError::Corrupt("RTR frames are not supported".to_string()));
    }

    let dlc = raw.can_dlc as usize;
    if dlc > 8 {
        return Err(CanError::Corrupt(format!("Invalid DLC: {} (max 8)", dlc)));
    }

    let payload = &raw.data[..dlc];
    let frame = if can_id & libc::CAN_EFF_FLAG != 0 {
        BusFrame::new_extended(can_id & libc::CAN_EFF_MASK, payload)
    } else {
        BusFrame::new_standard((can_id & libc::CAN_SFF_MASK) as u16, payload)
    }
    .map_err(|e| CanError::Corrupt(e.to_string()))?;

    Ok(RawFrame::Data(frame))
}

fn transmit_frame(socket: &CanSocket, frame: &BusFrame) -> Result<(), CanError> {
    let payload = frame.data_slice();
    let can_frame = if frame.is_extended() {
        ExtendedId::new(frame.id()).and_then(|id| CanFrame::new(id, payload))
    } else {
        StandardId::new(frame.id() as u16).and_then(|id| CanFrame::new(id, payload))
    }
    .ok_or_else(|| {
        CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::InvalidFrame,
            format!("Failed to build CAN frame with ID 0x{:X}", frame.id()),
        ))
    })?;

    socket.write_frame(&can_frame).map_err(|e| match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => CanError::Device(
            CanDeviceError::new(CanDeviceErrorKind::Busy, "SocketCAN transmit queue full"),
        ),
        _ => CanError::Io(e),
    })?;

    trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id(), frame.len());
    Ok(())
}

impl CanAdapter for SocketCanAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::SocketCan
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        transmit_frame(self.socket()?, &frame)
    }

    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        receive_frame(self.socket()?, timeout)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            trace!("SocketCAN interface '{}' closed", self.interface);
        }
    }

    /// RX 与 TX 通过 `dup()` 共享同一个打开文件描述
    ///
    /// 不要在任何一半上调用 `set_nonblocking()`，超时只依赖 poll 与 `SO_SNDTIMEO`。
    fn split(mut self: Box<Self>) -> Result<(Box<dyn RxAdapter>, Box<dyn TxAdapter>), CanError> {
        let socket = self.socket.take().ok_or(CanError::Closed)?;
        let rx_socket = CanSocket::from(std::os::fd::OwnedFd::from(
            socket.as_raw_socket().try_clone().map_err(CanError::Io)?,
        ));
        trace!("SocketCanAdapter split into RX and TX (interface: {})", self.interface);
        Ok((
            Box::new(SocketCanRx {
                socket: Some(rx_socket),
            }),
            Box::new(SocketCanTx {
                socket: Some(socket),
            }),
        ))
    }
}

pub struct SocketCanRx {
    socket: Option<CanSocket>,
}

impl RxAdapter for SocketCanRx {
    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        receive_frame(self.socket.as_ref().ok_or(CanError::Closed)?, timeout)
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

pub struct SocketCanTx {
    socket: Option<CanSocket>,
}

impl TxAdapter for SocketCanTx {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        transmit_frame(self.socket.as_ref().ok_or(CanError::Closed)?, &frame)
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Command;

    fn can_interface_exists(interface: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", interface])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// 要求 vcan0 接口存在，否则跳过测试
    macro_rules! require_vcan0 {
        () => {{
            if !can_interface_exists("vcan0") {
                eprintln!("Skipping test: vcan0 interface not available");
                return;
            }
            "vcan0"
        }};
    }

    fn raw_bytes(can_id: u32, dlc: u8, data: [u8; 8]) -> Vec<u8> {
        let mut raw: libc::can_frame = unsafe { std::mem::zeroed() };
        raw.can_id = can_id;
        raw.can_dlc = dlc;
        raw.data = data;
        let ptr = &raw as *const _ as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, CAN_FRAME_LEN) }.to_vec()
    }

    #[test]
    fn test_parse_extended_data_frame() {
        let bytes = raw_bytes(0x18FEEE00 | libc::CAN_EFF_FLAG, 2, [0x7D, 0x41, 0, 0, 0, 0, 0, 0]);
        match parse_raw_can_frame(&bytes).unwrap() {
            RawFrame::Data(frame) => {
                assert!(frame.is_extended());
                assert_eq!(frame.id(), 0x18FEEE00);
                assert_eq!(frame.data_slice(), &[0x7D, 0x41]);
            },
            _ => panic!("Expected data frame"),
        }
    }

    #[test]
    fn test_parse_short_read_is_corrupt() {
        let bytes = raw_bytes(0x123, 1, [0; 8]);
        assert!(matches!(
            parse_raw_can_frame(&bytes[..CAN_FRAME_LEN - 4]),
            Err(CanError::Corrupt(_))
        ));
    }

    #[test]
    fn test_parse_bad_dlc_is_corrupt() {
        let bytes = raw_bytes(0x123, 12, [0; 8]);
        assert!(matches!(parse_raw_can_frame(&bytes), Err(CanError::Corrupt(_))));
    }

    #[test]
    fn test_parse_error_frames() {
        let busoff = raw_bytes(libc::CAN_ERR_FLAG | CAN_ERR_BUSOFF, 8, [0; 8]);
        assert!(matches!(parse_raw_can_frame(&busoff).unwrap(), RawFrame::BusOff));

        let overflow = raw_bytes(
            libc::CAN_ERR_FLAG | CAN_ERR_CRTL,
            8,
            [0, CAN_ERR_CRTL_RX_OVERFLOW, 0, 0, 0, 0, 0, 0],
        );
        assert!(matches!(parse_raw_can_frame(&overflow).unwrap(), RawFrame::Overflow));

        let warning = raw_bytes(libc::CAN_ERR_FLAG | CAN_ERR_CRTL, 8, [0, 0x04, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            parse_raw_can_frame(&warning).unwrap(),
            RawFrame::OtherError(_)
        ));
    }

    #[test]
    fn test_new_invalid_interface() {
        match SocketCanAdapter::new("nonexistent_99") {
            Err(CanError::Device(e)) => assert!(e.message.contains("nonexistent_99")),
            other => panic!("Expected Device error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    #[serial]
    fn test_send_receive_echo_is_tx() {
        let interface = require_vcan0!();
        let mut adapter = SocketCanAdapter::new(interface).unwrap();
        let frame = BusFrame::new_extended(0x18F11CEF, &[0xA5, 0x5A]).unwrap();
        adapter.send(frame).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while std::time::Instant::now() < deadline {
            match adapter.receive_one(Duration::from_millis(50)) {
                Ok(rx) if rx.id() == 0x18F11CEF => {
                    assert_eq!(rx.direction(), Direction::Tx);
                    return;
                },
                Ok(_) | Err(CanError::Timeout) => continue,
                Err(e) => panic!("receive failed: {}", e),
            }
        }
        panic!("echo not received");
    }

    #[test]
    #[serial]
    fn test_closed_adapter_rejects_io() {
        let interface = require_vcan0!();
        let mut adapter = SocketCanAdapter::new(interface).unwrap();
        adapter.close();
        adapter.close();
        assert!(matches!(
            adapter.receive_one(Duration::from_millis(1)),
            Err(CanError::Closed)
        ));
    }

    #[test]
    #[serial]
    fn test_receive_timeout() {
        let interface = require_vcan0!();
        let adapter = Box::new(SocketCanAdapter::new(interface).unwrap());
        let (mut rx, _tx) = adapter.split().unwrap();
        // vcan0 上可能有其他流量，只检查不出现致命错误
        match rx.receive_one(Duration::from_millis(10)) {
            Ok(_) | Err(CanError::Timeout) => {},
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
