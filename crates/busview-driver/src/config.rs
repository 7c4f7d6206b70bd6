//! 配置
//!
//! - [`SessionConfig`]：会话运行参数（纯数据）
//! - [`BusviewConfig`]：`<config_dir>/busview/config.toml`，包含会话参数、
//!   默认连接参数、数据文件路径以及可选的 `[[pgn]]` 定义覆盖
//!
//! PGN 覆盖可以携带一个参考帧：构建注册表时解码该帧并与期望值比对，
//! 不一致则拒绝整个配置，避免错误的比例/偏移量悄悄生效。

use crate::error::ConfigError;
use busview_can::BackendKind;
use busview_protocol::{BusFrame, CodecRegistry, FieldDef, FieldValue, PgnDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// 已有连接时再次 `connect()` 的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectPolicy {
    /// 返回 `SessionError::InvalidState`
    #[default]
    FailIfConnected,
    /// 先断开旧连接
    ReplaceExisting,
}

/// 会话运行参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 单次接收等待（毫秒）；断开请求最迟在一个周期后被接收线程观察到
    pub receive_timeout_ms: u64,
    /// 每个订阅者的队列容量
    pub subscriber_capacity: usize,
    /// 发送队列容量
    pub tx_queue_capacity: usize,
    /// 单次发送（入队 + 写入）的最长等待（毫秒）
    pub tx_timeout_ms: u64,
    /// 断开时等待线程退出的上限（毫秒）
    pub join_timeout_ms: u64,
    pub connect_policy: ConnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 20,
            subscriber_capacity: 1024,
            tx_queue_capacity: 64,
            tx_timeout_ms: 1000,
            join_timeout_ms: 2000,
            connect_policy: ConnectPolicy::FailIfConnected,
        }
    }
}

impl SessionConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// 默认连接参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub interface: String,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            interface: "vcan0".to_string(),
            backend: BackendKind::default(),
            bitrate: Some(250_000),
        }
    }
}

/// 数据文件路径（未设置时使用数据目录下的默认文件）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presets: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<PathBuf>,
}

/// 参考帧及其期望解码值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFrame {
    pub id_hex: String,
    pub data_hex: String,
    pub expect: BTreeMap<String, f64>,
}

/// `[[pgn]]` 覆盖或扩展内置定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgnOverride {
    pub pgn: u32,
    pub name: String,
    #[serde(default)]
    pub can_id_hex: String,
    pub fields: Vec<FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceFrame>,
}

impl PgnOverride {
    pub fn definition(&self) -> PgnDefinition {
        PgnDefinition {
            pgn: self.pgn,
            can_id_hex: self.can_id_hex.clone(),
            name: self.name.clone(),
            fields: self.fields.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusviewConfig {
    pub session: SessionConfig,
    pub defaults: DefaultsSection,
    pub paths: PathsSection,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pgn: Vec<PgnOverride>,
}

impl BusviewConfig {
    /// `<config_dir>/busview/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("busview").join("config.toml"))
    }

    /// 读取配置；文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        info!("Config written to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn presets_path(&self) -> PathBuf {
        self.paths
            .presets
            .clone()
            .unwrap_or_else(|| data_dir().join("presets.json"))
    }

    pub fn groups_path(&self) -> PathBuf {
        self.paths
            .groups
            .clone()
            .unwrap_or_else(|| data_dir().join("groups.json"))
    }

    /// 内置定义 + `[[pgn]]` 覆盖，每个带参考帧的覆盖都会被校验
    pub fn build_registry(&self) -> Result<CodecRegistry, ConfigError> {
        let mut registry = CodecRegistry::builtin();
        for entry in &self.pgn {
            registry.insert(entry.definition())?;
            if let Some(reference) = &entry.reference {
                check_reference(&registry, entry, reference)?;
            }
            debug!("PGN {} ({}) loaded from config", entry.pgn, entry.name);
        }
        Ok(registry)
    }

    /// 按点分路径读取单个配置项（如 `defaults.interface`）
    pub fn get(&self, key: &str) -> Result<Option<toml::Value>, ConfigError> {
        let root = toml::Value::try_from(self)?;
        Ok(key
            .split('.')
            .try_fold(&root, |node, part| node.get(part))
            .cloned())
    }

    /// 按点分路径设置单个配置项
    ///
    /// 值按 TOML 字面量解析（`250000`、`true`、`"can0"`），解析失败时按字符串处理；
    /// 修改后的整份配置需能重新反序列化，否则返回错误且不修改 `self`。
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let mut root = toml::Value::try_from(&*self)?;
        let value = parse_literal(raw);

        let parts: Vec<&str> = key.split('.').collect();
        let Some((last, parents)) = parts.split_last() else {
            return Err(ConfigError::Invalid("empty key".into()));
        };
        let mut node = &mut root;
        for part in parents {
            let table = node
                .as_table_mut()
                .ok_or_else(|| ConfigError::Invalid(format!("'{}' is not a table", key)))?;
            node = table
                .entry(part.to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        }
        node.as_table_mut()
            .ok_or_else(|| ConfigError::Invalid(format!("'{}' is not a table", key)))?
            .insert(last.to_string(), value);

        let updated: BusviewConfig = root
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(format!("{}: {}", key, e)))?;
        *self = updated;
        Ok(())
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("busview")
}

fn parse_literal(raw: &str) -> toml::Value {
    toml::from_str::<BTreeMap<String, toml::Value>>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn check_reference(
    registry: &CodecRegistry,
    entry: &PgnOverride,
    reference: &ReferenceFrame,
) -> Result<(), ConfigError> {
    let mismatch = |field: &str, expected: f64, actual: String| ConfigError::ReferenceMismatch {
        pgn: entry.pgn,
        field: field.to_string(),
        expected,
        actual,
    };

    let frame = BusFrame::from_hex(&reference.id_hex, &reference.data_hex)
        .map_err(|e| ConfigError::Invalid(format!("PGN {} reference frame: {}", entry.pgn, e)))?;
    let decoded = registry.decode(frame.id(), frame.data())?;
    if decoded.pgn != entry.pgn {
        return Err(ConfigError::Invalid(format!(
            "PGN {} reference id {} carries PGN {}",
            entry.pgn, reference.id_hex, decoded.pgn
        )));
    }

    for (key, expected) in &reference.expect {
        let Some(field) = entry.fields.iter().find(|f| &f.key == key) else {
            return Err(mismatch(key, *expected, "unknown field".into()));
        };
        match decoded.fields.get(key) {
            Some(FieldValue::Value(actual)) if (actual - expected).abs() <= field.scale / 2.0 => {},
            Some(actual) => return Err(mismatch(key, *expected, actual.to_string())),
            None => return Err(mismatch(key, *expected, "missing".into())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERRIDE: &str = r#"
[defaults]
interface = "can1"
backend = "gs_usb"
bitrate = 500000

[[pgn]]
pgn = 65262
name = "Temps"
can_id_hex = "18FEEE00"

[[pgn.fields]]
key = "cool"
label = "Coolant Temp"
unit = "C"
width = 1
byte_offset = 0
scale = 1.0
offset = 40.0

[pgn.reference]
id_hex = "18FEEE00"
data_hex = "7DFFFFFFFFFFFFFF"
expect = { cool = 85.0 }
"#;

    #[test]
    fn test_default_values() {
        let config = BusviewConfig::default();
        assert_eq!(config.session.receive_timeout_ms, 20);
        assert_eq!(config.session.subscriber_capacity, 1024);
        assert_eq!(config.session.connect_policy, ConnectPolicy::FailIfConnected);
        assert_eq!(config.defaults.interface, "vcan0");
        assert_eq!(config.defaults.backend, BackendKind::SocketCan);
    }

    #[test]
    fn test_parse_override_and_build() {
        let config = BusviewConfig::parse(OVERRIDE).unwrap();
        assert_eq!(config.defaults.backend, BackendKind::GsUsb);
        assert_eq!(config.defaults.bitrate, Some(500_000));
        assert_eq!(config.session, SessionConfig::default());

        let registry = config.build_registry().unwrap();
        let temps = registry.get(65262).unwrap();
        assert_eq!(temps.fields.len(), 1);
        // 其他内置定义仍然存在
        assert!(registry.get(65253).is_some());
    }

    #[test]
    fn test_reference_mismatch_rejected() {
        let bad = OVERRIDE.replace("offset = 40.0", "offset = 50.0");
        let config = BusviewConfig::parse(&bad).unwrap();
        match config.build_registry() {
            Err(ConfigError::ReferenceMismatch { pgn, field, .. }) => {
                assert_eq!(pgn, 65262);
                assert_eq!(field, "cool");
            },
            other => panic!("expected ReferenceMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_definition_rejected() {
        let bad = OVERRIDE.replace("byte_offset = 0", "byte_offset = 8");
        let config = BusviewConfig::parse(&bad).unwrap();
        assert!(matches!(config.build_registry(), Err(ConfigError::Codec(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(BusviewConfig::load(&path).unwrap(), BusviewConfig::default());

        let config = BusviewConfig::parse(OVERRIDE).unwrap();
        config.save(&path).unwrap();
        assert_eq!(BusviewConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_get_and_set() {
        let mut config = BusviewConfig::default();
        config.set("defaults.interface", "can0").unwrap();
        config.set("defaults.bitrate", "125000").unwrap();
        config.set("session.connect_policy", "replace_existing").unwrap();

        assert_eq!(config.defaults.interface, "can0");
        assert_eq!(config.defaults.bitrate, Some(125_000));
        assert_eq!(config.session.connect_policy, ConnectPolicy::ReplaceExisting);
        assert_eq!(
            config.get("defaults.interface").unwrap(),
            Some(toml::Value::String("can0".into()))
        );
        assert_eq!(config.get("defaults.nope").unwrap(), None);

        assert!(config.set("session.receive_timeout_ms", "soon").is_err());
        assert_eq!(config.session.receive_timeout_ms, 20);
    }
}
