//! 打开 socket 前的接口状态检查

use crate::{CanDeviceError, CanDeviceErrorKind, CanError};
use std::ffi::CString;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// 检查接口是否存在以及是否处于 UP 状态
///
/// - `Ok(true)`: 存在且 UP
/// - `Ok(false)`: 存在但未启动
/// - `Err(CanError::Device)`: 接口不存在或名称非法
pub(crate) fn check_interface_status(interface: &str) -> Result<bool, CanError> {
    if interface.is_empty() || interface.len() >= libc::IFNAMSIZ {
        return Err(CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::UnsupportedConfig,
            format!(
                "Invalid interface name '{}' (1-{} characters)",
                interface,
                libc::IFNAMSIZ - 1
            ),
        )));
    }

    let c_name = CString::new(interface).map_err(|_| {
        CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::UnsupportedConfig,
            format!("Interface name '{}' contains a NUL byte", interface.escape_debug()),
        ))
    })?;

    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NotFound,
            format!(
                "CAN interface '{}' does not exist. Create it first, e.g.:\n  sudo ip link add dev {} type vcan",
                interface, interface
            ),
        )));
    }

    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if raw < 0 {
        return Err(CanError::Io(std::io::Error::last_os_error()));
    }
    // 离开作用域时自动 close
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(interface.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) };
    if ret < 0 {
        return Err(CanError::Io(std::io::Error::last_os_error()));
    }

    let flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int;
    Ok(flags & libc::IFF_UP != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_interface_is_not_found() {
        match check_interface_status("nonexistent99") {
            Err(CanError::Device(e)) => {
                assert_eq!(e.kind, CanDeviceErrorKind::NotFound);
                assert!(e.message.contains("nonexistent99"));
            },
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_overlong_name() {
        assert!(matches!(
            check_interface_status("a_name_that_is_way_too_long"),
            Err(CanError::Device(_))
        ));
        assert!(check_interface_status("").is_err());
    }

    #[test]
    fn test_loopback_device_is_up() {
        // lo 在任何 Linux 环境中都存在
        if let Ok(up) = check_interface_status("lo") {
            assert!(up);
        }
    }
}
