//! 进程内虚拟总线
//!
//! 同名接口的所有 `LoopbackAdapter` 连接到同一条总线：任何节点发送的帧
//! 投递给所有节点，发送者自己收到的副本标记为 `Direction::Tx`。
//! 在没有 SocketCAN 的平台上用于测试与演示。

use crate::{BackendKind, CanAdapter, CanError, RxAdapter, TxAdapter};
use busview_protocol::{BusFrame, Direction};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::trace;

/// 每个节点的接收队列深度
const PORT_CAPACITY: usize = 10_000;

static BUSES: OnceLock<Mutex<HashMap<String, Weak<BusCore>>>> = OnceLock::new();

struct Port {
    id: u64,
    tx: Sender<BusFrame>,
    // 队列满时用于丢弃最旧帧
    drain: Receiver<BusFrame>,
}

struct BusCore {
    ports: Mutex<Vec<Port>>,
    next_port: AtomicU64,
}

impl BusCore {
    fn attach(&self) -> (u64, Receiver<BusFrame>) {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(PORT_CAPACITY);
        self.ports.lock().push(Port {
            id,
            tx,
            drain: rx.clone(),
        });
        (id, rx)
    }

    fn detach(&self, id: u64) {
        self.ports.lock().retain(|p| p.id != id);
    }

    fn broadcast(&self, from: u64, frame: BusFrame) {
        let ports = self.ports.lock();
        for port in ports.iter() {
            let direction = if port.id == from {
                Direction::Tx
            } else {
                Direction::Rx
            };
            let mut copy = frame.with_direction(direction);
            loop {
                match port.tx.try_send(copy) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        let _ = port.drain.try_recv();
                        copy = back;
                    },
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }
    }
}

fn bus_for(name: &str) -> Arc<BusCore> {
    let mut buses = BUSES.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(core) = buses.get(name).and_then(Weak::upgrade) {
        return core;
    }
    let core = Arc::new(BusCore {
        ports: Mutex::new(Vec::new()),
        next_port: AtomicU64::new(0),
    });
    buses.insert(name.to_string(), Arc::downgrade(&core));
    core
}

/// 进程内虚拟总线上的一个节点
pub struct LoopbackAdapter {
    interface: String,
    core: Arc<BusCore>,
    port: u64,
    rx: Option<Receiver<BusFrame>>,
}

impl LoopbackAdapter {
    /// 连接到名为 `interface` 的虚拟总线（不存在则创建）
    pub fn attach(interface: &str) -> Self {
        let core = bus_for(interface);
        let (port, rx) = core.attach();
        trace!("Loopback node {} attached to '{}'", port, interface);
        Self {
            interface: interface.to_string(),
            core,
            port,
            rx: Some(rx),
        }
    }
}

fn recv_from(rx: &Receiver<BusFrame>, timeout: Duration) -> Result<BusFrame, CanError> {
    match rx.recv_timeout(timeout) {
        Ok(frame) => Ok(frame),
        Err(RecvTimeoutError::Timeout) => Err(CanError::Timeout),
        Err(RecvTimeoutError::Disconnected) => Err(CanError::Closed),
    }
}

impl CanAdapter for LoopbackAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Loopback
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        if self.rx.is_none() {
            return Err(CanError::Closed);
        }
        self.core.broadcast(self.port, frame);
        Ok(())
    }

    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        let rx = self.rx.as_ref().ok_or(CanError::Closed)?;
        recv_from(rx, timeout)
    }

    fn close(&mut self) {
        if self.rx.take().is_some() {
            self.core.detach(self.port);
        }
    }

    fn split(mut self: Box<Self>) -> Result<(Box<dyn RxAdapter>, Box<dyn TxAdapter>), CanError> {
        let rx = self.rx.take().ok_or(CanError::Closed)?;
        let shared = Arc::new(PortGuard {
            core: Arc::clone(&self.core),
            port: self.port,
        });
        Ok((
            Box::new(LoopbackRx {
                rx: Some(rx),
                _guard: Arc::clone(&shared),
            }),
            Box::new(LoopbackTx {
                guard: Some(shared),
            }),
        ))
    }
}

impl Drop for LoopbackAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

/// 两个半边都释放后才从总线摘除端口
struct PortGuard {
    core: Arc<BusCore>,
    port: u64,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.core.detach(self.port);
    }
}

pub struct LoopbackRx {
    rx: Option<Receiver<BusFrame>>,
    _guard: Arc<PortGuard>,
}

impl RxAdapter for LoopbackRx {
    fn receive_one(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        let rx = self.rx.as_ref().ok_or(CanError::Closed)?;
        recv_from(rx, timeout)
    }

    fn close(&mut self) {
        self.rx = None;
    }
}

pub struct LoopbackTx {
    guard: Option<Arc<PortGuard>>,
}

impl TxAdapter for LoopbackTx {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        let guard = self.guard.as_ref().ok_or(CanError::Closed)?;
        guard.core.broadcast(guard.port, frame);
        Ok(())
    }

    fn close(&mut self) {
        self.guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32) -> BusFrame {
        BusFrame::new_extended(id, &[0x11, 0x22]).unwrap()
    }

    #[test]
    fn test_peers_see_rx_and_sender_sees_tx() {
        let mut a = LoopbackAdapter::attach("lb-peers");
        let mut b = LoopbackAdapter::attach("lb-peers");

        a.send(frame(0x100)).unwrap();

        let at_b = b.receive_one(Duration::from_millis(50)).unwrap();
        assert_eq!(at_b.direction(), Direction::Rx);
        let at_a = a.receive_one(Duration::from_millis(50)).unwrap();
        assert_eq!(at_a.direction(), Direction::Tx);
    }

    #[test]
    fn test_separate_names_are_isolated() {
        let mut a = LoopbackAdapter::attach("lb-iso-a");
        let mut b = LoopbackAdapter::attach("lb-iso-b");
        a.send(frame(0x1)).unwrap();
        assert!(matches!(
            b.receive_one(Duration::from_millis(10)),
            Err(CanError::Timeout)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut a = LoopbackAdapter::attach("lb-close");
        a.close();
        a.close();
        assert!(matches!(a.send(frame(0x1)), Err(CanError::Closed)));
        assert!(matches!(
            a.receive_one(Duration::from_millis(1)),
            Err(CanError::Closed)
        ));
    }

    #[test]
    fn test_split_halves_share_one_port() {
        let adapter = Box::new(LoopbackAdapter::attach("lb-split"));
        let mut peer = LoopbackAdapter::attach("lb-split");
        let (mut rx, mut tx) = adapter.split().unwrap();

        tx.send(frame(0x42)).unwrap();
        let echo = rx.receive_one(Duration::from_millis(50)).unwrap();
        assert_eq!(echo.direction(), Direction::Tx);
        assert_eq!(
            peer.receive_one(Duration::from_millis(50)).unwrap().direction(),
            Direction::Rx
        );

        peer.send(frame(0x43)).unwrap();
        let incoming = rx.receive_one(Duration::from_millis(50)).unwrap();
        assert_eq!(incoming.id(), 0x43);
        assert_eq!(incoming.direction(), Direction::Rx);

        tx.close();
        assert!(matches!(tx.send(frame(0x44)), Err(CanError::Closed)));
    }

    #[test]
    fn test_full_port_drops_oldest() {
        let mut sender = LoopbackAdapter::attach("lb-full");
        let mut slow = LoopbackAdapter::attach("lb-full");
        for i in 0..(PORT_CAPACITY as u32 + 5) {
            sender.send(frame(i)).unwrap();
        }
        let first = slow.receive_one(Duration::from_millis(50)).unwrap();
        assert_eq!(first.id(), 5);
    }
}
