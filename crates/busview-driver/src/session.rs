//! 会话：一个活动连接的生命周期
//!
//! 连接后适配器被拆分为两半，各由一个线程持有：
//!
//! - RX 线程：带超时地逐帧接收，打单调时间戳，尝试 PGN 解码，交给 [`Hub`] 扇出
//! - TX 线程：单写者，按 FIFO 处理发送队列，保证并发调用者的写入不会交错
//!
//! 状态切换（connect / disconnect）由 `connection` 互斥锁串行化；
//! 发送与查询只短暂读取共享状态，不会被正在进行的断开阻塞。

use crate::config::{ConnectPolicy, SessionConfig};
use crate::error::SessionError;
use crate::hub::{Hub, HubEvent, ReceivedFrame, Subscription};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::state::{AtomicConnectionState, ConnectionState};
use crate::wire::{PgnRef, TransmitOutcome, TransmitRequest};
use busview_can::{BackendKind, CanAdapter, CanError, RxAdapter, TxAdapter};
use busview_protocol::j1939::{DEFAULT_PRIORITY, NULL_ADDRESS};
use busview_protocol::{BusFrame, CodecRegistry, J1939Id, PgnSelector, monotonic_seconds};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 自检帧 ID
pub const SELFTEST_ID: u32 = 0x18F1_1CEF;

/// 自检帧负载
pub const SELFTEST_PAYLOAD: [u8; 8] = [0xA5, 0x5A, 0x55, 0xA5, 0x5A, 0x55, 0xA5, 0x5A];

/// 自检默认等待时间
pub const SELFTEST_TIMEOUT: Duration = Duration::from_millis(300);

/// Extension trait for timeout-capable thread joins
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 适配器打开接缝（测试中替换为脚本化适配器）
pub trait AdapterFactory: Send + Sync {
    fn open(
        &self,
        interface: &str,
        backend: BackendKind,
        bitrate: Option<u32>,
    ) -> Result<Box<dyn CanAdapter>, CanError>;
}

/// 使用 [`busview_can::open`] 打开真实后端
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAdapters;

impl AdapterFactory for SystemAdapters {
    fn open(
        &self,
        interface: &str,
        backend: BackendKind,
        bitrate: Option<u32>,
    ) -> Result<Box<dyn CanAdapter>, CanError> {
        busview_can::open(interface, backend, bitrate)
    }
}

/// 当前连接的描述信息
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectionInfo {
    interface: String,
    backend: BackendKind,
    bitrate: Option<u32>,
}

/// 状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub subscribers: usize,
    pub metrics: MetricsSnapshot,
}

/// 自检结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfTestReport {
    pub connected: bool,
    pub tx_ok: bool,
    pub echo_rx: bool,
    /// 等待期间收到的帧数
    pub rx_seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 线程间共享的会话状态
struct Shared {
    state: AtomicConnectionState,
    last_error: Mutex<Option<String>>,
    info: Mutex<Option<ConnectionInfo>>,
    metrics: PipelineMetrics,
    hub: Arc<Hub>,
    codec: Arc<CodecRegistry>,
}

struct TxJob {
    frame: BusFrame,
    reply: Sender<Result<(), CanError>>,
}

/// 活动连接持有的线程
struct Connection {
    is_running: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
}

pub struct Session {
    config: SessionConfig,
    factory: Arc<dyn AdapterFactory>,
    shared: Arc<Shared>,
    /// 状态切换锁
    connection: Mutex<Option<Connection>>,
    /// 发送队列入口；断开时在 RX 线程退出后取走
    tx_queue: Mutex<Option<Sender<TxJob>>>,
}

impl Session {
    pub fn new(config: SessionConfig, codec: Arc<CodecRegistry>) -> Self {
        Self::with_factory(config, codec, Arc::new(SystemAdapters))
    }

    pub fn with_factory(
        config: SessionConfig,
        codec: Arc<CodecRegistry>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        let hub = Hub::new(config.subscriber_capacity);
        Self {
            config,
            factory,
            shared: Arc::new(Shared {
                state: AtomicConnectionState::default(),
                last_error: Mutex::new(None),
                info: Mutex::new(None),
                metrics: PipelineMetrics::new(),
                hub,
                codec,
            }),
            connection: Mutex::new(None),
            tx_queue: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn codec(&self) -> &Arc<CodecRegistry> {
        &self.shared.codec
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.shared.hub
    }

    /// 订阅接收流
    pub fn subscribe(&self) -> Subscription {
        self.shared.hub.subscribe()
    }

    /// 打开适配器并启动 RX / TX 线程
    ///
    /// 只有 `Disconnected` 状态可以连接；其他状态按 [`ConnectPolicy`] 处理。
    /// 打开失败时会话保持 `Disconnected`，错误同时记录为 `last_error`。
    pub fn connect(
        &self,
        interface: &str,
        backend: BackendKind,
        bitrate: Option<u32>,
    ) -> Result<(), SessionError> {
        let mut connection = self.connection.lock();

        let current = self.shared.state.get();
        if current != ConnectionState::Disconnected {
            match self.config.connect_policy {
                ConnectPolicy::FailIfConnected => {
                    return Err(SessionError::InvalidState(current));
                },
                ConnectPolicy::ReplaceExisting => {
                    info!("Replacing existing {} session", current);
                    self.teardown(&mut connection, "replaced by a new connection");
                },
            }
        }

        self.shared.state.set(ConnectionState::Connecting);
        *self.shared.last_error.lock() = None;
        info!("Connecting to '{}' via {} (bitrate {:?})", interface, backend, bitrate);

        let halves = self
            .factory
            .open(interface, backend, bitrate)
            .and_then(|adapter| adapter.split());
        let (rx, tx) = match halves {
            Ok(halves) => halves,
            Err(e) => {
                warn!("Failed to open '{}': {}", interface, e);
                *self.shared.last_error.lock() = Some(e.to_string());
                self.shared.state.set(ConnectionState::Disconnected);
                return Err(SessionError::Connect(e));
            },
        };

        self.shared.metrics.reset();
        *self.shared.info.lock() = Some(ConnectionInfo {
            interface: interface.to_string(),
            backend,
            bitrate,
        });

        let is_running = Arc::new(AtomicBool::new(true));
        let (job_tx, job_rx) = crossbeam_channel::bounded(self.config.tx_queue_capacity.max(1));
        *self.tx_queue.lock() = Some(job_tx);
        // 线程启动前进入 Connected，RX 线程的 Connected → Error 切换才不会被覆盖
        self.shared.state.set(ConnectionState::Connected);

        let mut active = Connection {
            is_running: Arc::clone(&is_running),
            rx_thread: None,
            tx_thread: None,
        };

        let spawned = self
            .spawn_rx(rx, Arc::clone(&is_running))
            .and_then(|handle| {
                active.rx_thread = Some(handle);
                self.spawn_tx(tx, job_rx)
            });
        match spawned {
            Ok(handle) => active.tx_thread = Some(handle),
            Err(e) => {
                error!("Failed to spawn session thread: {}", e);
                *connection = Some(active);
                self.teardown(&mut connection, "session thread failed to start");
                *self.shared.last_error.lock() = Some(e.to_string());
                return Err(SessionError::Connect(CanError::Io(e)));
            },
        }

        *connection = Some(active);
        info!("Session connected to '{}'", interface);
        Ok(())
    }

    /// 停止线程、关闭适配器并回到 `Disconnected`；任何状态下都成功
    pub fn disconnect(&self) {
        let mut connection = self.connection.lock();
        self.teardown(&mut connection, "disconnected");
    }

    fn teardown(&self, connection: &mut Option<Connection>, reason: &str) {
        // 新的发送请求从这里开始被拒绝
        self.shared.state.set(ConnectionState::Disconnected);
        let join_timeout = self.config.join_timeout();
        let mut active = connection.take();

        // 先停 RX：发送半部仍然打开，接收端不会看到关闭错误
        if let Some(active) = active.as_mut() {
            active.is_running.store(false, Ordering::Release);
            if let Some(handle) = active.rx_thread.take()
                && let Err(_e) = handle.join_timeout(join_timeout)
            {
                error!(
                    "RX thread panicked or failed to shut down within {:?}",
                    join_timeout
                );
            }
        }

        // 关闭发送入口：TX 线程处理完已排队的请求后因通道断开而退出
        drop(self.tx_queue.lock().take());

        if let Some(mut active) = active {
            if let Some(handle) = active.tx_thread.take()
                && let Err(_e) = handle.join_timeout(join_timeout)
            {
                error!(
                    "TX thread panicked or failed to shut down within {:?}",
                    join_timeout
                );
            }
            info!("Session closed: {}", reason);
        }

        *self.shared.info.lock() = None;
        self.shared.hub.end_stream(reason);
    }

    fn spawn_rx(
        &self,
        rx: Box<dyn RxAdapter>,
        is_running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        let timeout = self.config.receive_timeout();
        std::thread::Builder::new()
            .name("busview-rx".into())
            .spawn(move || rx_loop(rx, shared, is_running, timeout))
    }

    fn spawn_tx(
        &self,
        tx: Box<dyn TxAdapter>,
        jobs: Receiver<TxJob>,
    ) -> std::io::Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("busview-tx".into())
            .spawn(move || tx_loop(tx, jobs, shared))
    }

    /// 把请求转换为待发送的帧（不需要连接）
    ///
    /// 符号化请求经编解码表严格编码，29-bit ID 由优先级、PGN 与源地址组装。
    pub fn build_frame(&self, request: &TransmitRequest) -> Result<BusFrame, SessionError> {
        match request {
            TransmitRequest::Raw {
                arbitration_id_hex,
                payload_hex,
            } => Ok(BusFrame::from_hex(arbitration_id_hex, payload_hex)?),
            TransmitRequest::Symbolic {
                pgn,
                field_values,
                source_address,
                priority,
            } => {
                let selector = match pgn {
                    PgnRef::Number(n) => PgnSelector::Number(*n),
                    PgnRef::Name(name) => PgnSelector::Name(name),
                };
                let def = self.shared.codec.resolve(selector)?;
                let priority = priority.unwrap_or(DEFAULT_PRIORITY);
                if priority > 7 {
                    return Err(SessionError::InvalidRequest(format!(
                        "priority {} out of range 0..=7",
                        priority
                    )));
                }
                let payload = self.shared.codec.encode(def.pgn, field_values)?;
                let id = J1939Id::compose(
                    priority,
                    def.pgn,
                    source_address.unwrap_or(NULL_ADDRESS),
                );
                Ok(BusFrame::new_extended(id.raw(), &payload)?)
            },
        }
    }

    /// 发送一个请求，返回实际写出的帧
    pub fn transmit(&self, request: &TransmitRequest) -> Result<BusFrame, SessionError> {
        let frame = self.build_frame(request)?;
        self.send_frame(frame)?;
        Ok(frame)
    }

    /// 逐个发送，单个失败不影响后续请求
    pub fn transmit_batch(&self, requests: &[TransmitRequest]) -> Vec<TransmitOutcome> {
        requests
            .iter()
            .map(|request| match self.build_frame(request) {
                Ok(frame) => {
                    let id_hex = Some(frame.id_hex());
                    match self.send_frame(frame) {
                        Ok(()) => TransmitOutcome {
                            arbitration_id_hex: id_hex,
                            ok: true,
                            error: None,
                        },
                        Err(e) => TransmitOutcome {
                            arbitration_id_hex: id_hex,
                            ok: false,
                            error: Some(e.to_string()),
                        },
                    }
                },
                Err(e) => TransmitOutcome {
                    arbitration_id_hex: None,
                    ok: false,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    /// 经单写者队列发送一帧，等待写入结果（最长 `tx_timeout`）
    pub fn send_frame(&self, frame: BusFrame) -> Result<(), SessionError> {
        let state = self.shared.state.get();
        if state != ConnectionState::Connected {
            return Err(SessionError::InvalidState(state));
        }
        let queue = self
            .tx_queue
            .lock()
            .clone()
            .ok_or(SessionError::ChannelClosed)?;

        let deadline = Instant::now() + self.config.tx_timeout();
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        match queue.send_timeout(
            TxJob {
                frame,
                reply: reply_tx,
            },
            deadline.saturating_duration_since(Instant::now()),
        ) {
            Ok(()) => {},
            Err(SendTimeoutError::Timeout(_)) => {
                self.shared.metrics.tx_errors.fetch_add(1, Ordering::Relaxed);
                return Err(SessionError::ChannelFull);
            },
            Err(SendTimeoutError::Disconnected(_)) => return Err(SessionError::ChannelClosed),
        }

        match reply_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result.map_err(SessionError::Transport),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::ChannelClosed),
        }
    }

    /// 发送自检帧并在私有订阅上等待回显
    pub fn selftest(&self, timeout: Duration) -> SelfTestReport {
        let mut report = SelfTestReport {
            connected: self.state().is_connected(),
            tx_ok: false,
            echo_rx: false,
            rx_seen: 0,
            error: None,
        };
        if !report.connected {
            report.error = Some("not connected".to_string());
            return report;
        }

        // 先订阅再发送，回显不会落在订阅之前
        let subscription = self.subscribe();
        let frame = match BusFrame::new_extended(SELFTEST_ID, &SELFTEST_PAYLOAD) {
            Ok(frame) => frame,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            },
        };
        if let Err(e) = self.send_frame(frame) {
            report.error = Some(e.to_string());
            return report;
        }
        report.tx_ok = true;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match subscription.recv_timeout(remaining) {
                Ok(HubEvent::Frame(received)) => {
                    report.rx_seen += 1;
                    if received.frame.id() == SELFTEST_ID && received.frame.data() == &SELFTEST_PAYLOAD
                    {
                        report.echo_rx = true;
                        break;
                    }
                },
                Ok(HubEvent::EndOfStream { reason }) => {
                    report.error = Some(reason);
                    break;
                },
                Err(_) => break,
            }
        }
        debug!(
            "Self-test finished: echo_rx={}, rx_seen={}",
            report.echo_rx, report.rx_seen
        );
        report
    }

    pub fn health(&self) -> HealthSnapshot {
        let info = self.shared.info.lock().clone();
        HealthSnapshot {
            state: self.state(),
            interface: info.as_ref().map(|i| i.interface.clone()),
            backend: info.as_ref().map(|i| i.backend),
            bitrate: info.as_ref().and_then(|i| i.bitrate),
            last_error: self.last_error(),
            subscribers: self.shared.hub.subscriber_count(),
            metrics: self.shared.metrics.snapshot(self.shared.hub.dropped_total()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut connection = self.connection.lock();
        if connection.is_some() {
            self.teardown(&mut connection, "session dropped");
        }
    }
}

/// RX 线程主循环
///
/// 每次接收最多等待 `timeout`，在两次接收之间检查运行标志。
/// 时间戳在会话内单调不减；致命错误使会话进入 `Error` 并结束广播流。
fn rx_loop(
    mut rx: Box<dyn RxAdapter>,
    shared: Arc<Shared>,
    is_running: Arc<AtomicBool>,
    timeout: Duration,
) {
    let mut last_timestamp = 0.0_f64;

    loop {
        // Acquire: If we see false, we must see all cleanup writes from other threads
        if !is_running.load(Ordering::Acquire) {
            trace!("RX thread: is_running flag is false, exiting");
            break;
        }

        match rx.receive_one(timeout) {
            Ok(frame) => {
                shared.metrics.rx_frames.fetch_add(1, Ordering::Relaxed);

                let timestamp = monotonic_seconds().max(last_timestamp);
                last_timestamp = timestamp;
                let frame = frame.with_timestamp(timestamp);

                let decoded = if frame.is_extended() {
                    shared.codec.decode(frame.id(), frame.data()).ok()
                } else {
                    None
                };
                if decoded.is_some() {
                    shared.metrics.decode_hits.fetch_add(1, Ordering::Relaxed);
                }
                trace!(
                    "RX {} [{}] {}",
                    frame.id_hex(),
                    frame.len(),
                    frame.payload_hex()
                );
                shared
                    .hub
                    .publish(Arc::new(ReceivedFrame { frame, decoded }));
            },
            Err(CanError::Timeout) => {
                shared.metrics.rx_timeouts.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) if !e.is_fatal() => {
                if matches!(e, CanError::Corrupt(_)) {
                    shared.metrics.corrupt_frames.fetch_add(1, Ordering::Relaxed);
                }
                warn!("RX thread: recoverable receive error: {}", e);
            },
            Err(e) if !is_running.load(Ordering::Acquire) => {
                // 断开过程中适配器被关闭，不是传输故障
                debug!("RX thread: receive ended during shutdown: {}", e);
                break;
            },
            Err(e) => {
                error!("RX thread: fatal receive error: {}", e);
                let reason = e.to_string();
                *shared.last_error.lock() = Some(reason.clone());
                // Release: All writes before this are visible to threads that see the false value
                is_running.store(false, Ordering::Release);
                shared
                    .state
                    .transition(ConnectionState::Connected, ConnectionState::Error);
                shared.hub.end_stream(&reason);
                break;
            },
        }
    }

    rx.close();
    trace!("RX thread: loop exited");
}

/// TX 线程主循环（单写者）
///
/// 只在发送入口全部释放、队列取空后退出，断开前已入队的请求都会被写出。
fn tx_loop(mut tx: Box<dyn TxAdapter>, jobs: Receiver<TxJob>, shared: Arc<Shared>) {
    for job in jobs.iter() {
        let result = tx.send(job.frame);
        match &result {
            Ok(()) => {
                shared.metrics.tx_frames.fetch_add(1, Ordering::Relaxed);
                trace!("TX {} {}", job.frame.id_hex(), job.frame.payload_hex());
            },
            Err(e) => {
                shared.metrics.tx_errors.fetch_add(1, Ordering::Relaxed);
                warn!("TX thread: send failed: {}", e);
            },
        }
        // 调用方可能已超时离开
        let _ = job.reply.send(result);
    }

    tx.close();
    trace!("TX thread: loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn session() -> Session {
        Session::new(SessionConfig::default(), Arc::new(CodecRegistry::builtin()))
    }

    #[test]
    fn test_build_raw_frame() {
        let frame = session()
            .build_frame(&TransmitRequest::raw("18FEEE00", "7D FF"))
            .unwrap();
        assert_eq!(frame.id(), 0x18FEEE00);
        assert!(frame.is_extended());
        assert_eq!(frame.data_slice(), &[0x7D, 0xFF]);
    }

    #[test]
    fn test_build_symbolic_frame() {
        let request = TransmitRequest::symbolic(
            PgnRef::Name("Temps".into()),
            BTreeMap::from([("cool".to_string(), 85.0)]),
        );
        let frame = session().build_frame(&request).unwrap();
        // 优先级 6、PGN 65262、源地址 0xFE
        assert_eq!(frame.id(), 0x18FEEEFE);
        assert_eq!(frame.data(), &[0x7D, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_build_symbolic_with_address_and_priority() {
        let request = TransmitRequest::Symbolic {
            pgn: PgnRef::Number(65253),
            field_values: BTreeMap::from([("hours".to_string(), 100.0)]),
            source_address: Some(0x00),
            priority: Some(3),
        };
        let frame = session().build_frame(&request).unwrap();
        assert_eq!(frame.id(), 0x0CFEE500);
        assert_eq!(&frame.data()[..4], &[0xD0, 0x07, 0x00, 0x00]);
    }

    #[test]
    fn test_build_rejects_bad_requests() {
        let s = session();
        assert!(matches!(
            s.build_frame(&TransmitRequest::symbolic(PgnRef::Number(1), BTreeMap::new())),
            Err(SessionError::Codec(_))
        ));
        assert!(matches!(
            s.build_frame(&TransmitRequest::raw("18FEEE00", "zz")),
            Err(SessionError::Frame(_))
        ));
        let request = TransmitRequest::Symbolic {
            pgn: PgnRef::Number(65262),
            field_values: BTreeMap::new(),
            source_address: None,
            priority: Some(9),
        };
        assert!(matches!(
            s.build_frame(&request),
            Err(SessionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_transmit_requires_connection() {
        let s = session();
        assert!(matches!(
            s.transmit(&TransmitRequest::raw("123", "00")),
            Err(SessionError::InvalidState(ConnectionState::Disconnected))
        ));
        let report = s.selftest(SELFTEST_TIMEOUT);
        assert!(!report.connected);
        assert!(!report.tx_ok);
    }

    #[test]
    fn test_disconnect_when_idle() {
        let s = session();
        s.disconnect();
        s.disconnect();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.health().interface, None);
    }
}
