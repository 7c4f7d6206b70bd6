//! 会话连接状态
//!
//! `Disconnected → Connecting → Connected → Disconnected`，
//! 接收线程遇到致命错误时 `Connected → Error`，之后只能 `disconnect()`。

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Hash, IntoPrimitive, TryFromPrimitive, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        })
    }
}

/// 原子版本，接收线程与调用线程共享
#[derive(Debug, Default)]
pub struct AtomicConnectionState {
    inner: AtomicU8,
}

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            inner: AtomicU8::new(state.into()),
        }
    }

    /// 无效值按 `Error` 处理
    pub fn get(&self) -> ConnectionState {
        ConnectionState::try_from(self.inner.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Error)
    }

    pub fn set(&self, state: ConnectionState) {
        self.inner.store(state.into(), Ordering::Release);
    }

    /// 仅当当前状态为 `current` 时切换，返回是否成功
    pub fn transition(&self, current: ConnectionState, new: ConnectionState) -> bool {
        self.inner
            .compare_exchange(current.into(), new.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_u8() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
        ] {
            let raw: u8 = state.into();
            assert_eq!(ConnectionState::try_from(raw).unwrap(), state);
        }
        assert!(ConnectionState::try_from(9u8).is_err());
    }

    #[test]
    fn test_atomic_transition() {
        let state = AtomicConnectionState::default();
        assert_eq!(state.get(), ConnectionState::Disconnected);

        assert!(!state.transition(ConnectionState::Connected, ConnectionState::Error));
        assert!(state.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert_eq!(state.get(), ConnectionState::Connecting);

        state.set(ConnectionState::Connected);
        assert!(state.get().is_connected());
    }

    #[test]
    fn test_state_json() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
    }
}
