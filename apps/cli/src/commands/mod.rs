//! 命令定义和实现

pub mod config;
pub mod decode;
pub mod link;
pub mod monitor;
pub mod presets;
pub mod selftest;
pub mod send;

pub use config::ConfigCommand;
pub use decode::DecodeCommand;
pub use link::LinkCommand;
pub use monitor::MonitorCommand;
pub use presets::PresetsCommand;
pub use selftest::SelfTestCommand;
pub use send::SendCommand;
