//! # Busview Driver
//!
//! 会话层：在 `busview-can` 适配器之上管理一个活动连接。
//!
//! - [`Session`]：连接状态机、接收线程、单写者发送队列
//! - [`Hub`]：把接收到的帧扇出给多个订阅者（有界队列，满时丢弃最旧帧）
//! - [`sink`]：订阅者的投递目标（CSV 日志、JSON Lines）
//! - [`wire`]：对外的 JSON 形状
//! - [`config`]：会话参数与 TOML 配置文件
//! - [`presets`]：预设帧 / 帧组只读存储

pub mod config;
mod error;
pub mod hub;
pub mod metrics;
pub mod presets;
mod session;
pub mod sink;
pub mod state;
pub mod wire;

pub use config::{BusviewConfig, ConnectPolicy, SessionConfig};
pub use error::{ConfigError, PresetError, SessionError};
pub use hub::{Hub, HubEvent, ReceivedFrame, Subscription};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use presets::{JsonPresetStore, Preset, PresetGroup};
pub use session::{AdapterFactory, HealthSnapshot, SelfTestReport, Session, SystemAdapters};
pub use sink::{CsvLogSink, FrameSink, JsonLinesSink, spawn_delivery};
pub use state::{AtomicConnectionState, ConnectionState};
pub use wire::{BringUpRequest, BringUpResult, StreamEvent, TransmitOutcome, TransmitRequest, WireFrame};
