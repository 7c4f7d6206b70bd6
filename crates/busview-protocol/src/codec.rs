//! PGN 编解码注册表
//!
//! 每个 [`PgnDefinition`] 描述一个单帧参数组的字段布局。字段按
//! `value = raw * scale - offset` 换算为工程单位，原始值等于宽度对应的
//! 哨兵值（0xFF / 0xFFFF / 0xFFFFFFFF）时表示"不可用"。
//!
//! ```rust
//! use busview_protocol::{CodecRegistry, FieldValue};
//! use std::collections::BTreeMap;
//!
//! let registry = CodecRegistry::builtin();
//! let payload = registry
//!     .encode("Temps", &BTreeMap::from([("cool".to_string(), 85.0)]))
//!     .unwrap();
//! assert_eq!(payload[0], 0x7D);
//!
//! let decoded = registry.decode(0x18FEEE00, &payload).unwrap();
//! assert_eq!(decoded.fields["cool"], FieldValue::Value(85.0));
//! assert_eq!(decoded.fields["fuel_temp"], FieldValue::NotAvailable);
//! ```

use crate::j1939::J1939Id;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// 编解码错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// 没有匹配的 PGN 定义（解码时非致命，帧仍会以未解码形式转发）
    #[error("Unknown PGN: {0}")]
    UnknownPgn(String),

    #[error("Unknown field '{field}' for PGN {pgn}")]
    UnknownField { pgn: u32, field: String },

    /// 数值超出字段可表示范围（不会静默回绕）
    #[error("Value {value} out of range for field '{field}' (representable {min}..={max})")]
    FieldOutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid definition for PGN {pgn}: {reason}")]
    InvalidDefinition { pgn: u32, reason: String },
}

/// 字段宽度（字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
#[repr(u8)]
pub enum FieldWidth {
    One = 1,
    Two = 2,
    Four = 4,
}

impl From<FieldWidth> for u8 {
    fn from(width: FieldWidth) -> Self {
        width as u8
    }
}

impl FieldWidth {
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// "不可用"哨兵值（全 1）
    pub fn sentinel(self) -> u32 {
        match self {
            FieldWidth::One => 0xFF,
            FieldWidth::Two => 0xFFFF,
            FieldWidth::Four => 0xFFFF_FFFF,
        }
    }

    /// 有效值的最大原始值（哨兵减一）
    pub fn max_raw(self) -> u32 {
        self.sentinel() - 1
    }
}

/// 字段定义
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldDef {
    pub key: String,
    pub label: String,
    pub unit: String,
    pub width: FieldWidth,
    pub byte_offset: usize,
    /// 每个最低有效位对应的工程单位
    pub scale: f64,
    pub offset: f64,
}

impl FieldDef {
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
        width: FieldWidth,
        byte_offset: usize,
        scale: f64,
        offset: f64,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            unit: unit.into(),
            width,
            byte_offset,
            scale,
            offset,
        }
    }

    /// 可编码的最小工程值
    pub fn min_value(&self) -> f64 {
        -self.offset
    }

    /// 可编码的最大工程值
    pub fn max_value(&self) -> f64 {
        f64::from(self.width.max_raw()) * self.scale - self.offset
    }

    /// 读取原始值（小端）
    pub fn read_raw(&self, payload: &[u8; 8]) -> u32 {
        payload[self.byte_offset..self.byte_offset + self.width.bytes()]
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
    }

    /// 写入原始值（小端）
    pub fn write_raw(&self, payload: &mut [u8; 8], raw: u32) {
        let bytes = raw.to_le_bytes();
        let n = self.width.bytes();
        payload[self.byte_offset..self.byte_offset + n].copy_from_slice(&bytes[..n]);
    }

    pub fn decode(&self, payload: &[u8; 8]) -> FieldValue {
        let raw = self.read_raw(payload);
        if raw == self.width.sentinel() {
            FieldValue::NotAvailable
        } else {
            FieldValue::Value(f64::from(raw) * self.scale - self.offset)
        }
    }

    /// 严格编码：超出范围返回 `FieldOutOfRange`
    ///
    /// 四舍五入恰好落在哨兵值上时取哨兵减一。
    pub fn encode_raw(&self, value: f64) -> Result<u32, CodecError> {
        let (raw, truncated) = self.quantize(value);
        match (raw, truncated) {
            (Some(raw), false) => Ok(raw),
            _ => Err(self.out_of_range(value)),
        }
    }

    /// 截断编码：钳位到 `[0, sentinel-1]`，返回是否发生截断
    pub fn encode_raw_clamped(&self, value: f64) -> Result<(u32, bool), CodecError> {
        match self.quantize(value) {
            (Some(raw), truncated) => Ok((raw, truncated)),
            (None, _) => Err(self.out_of_range(value)),
        }
    }

    fn quantize(&self, value: f64) -> (Option<u32>, bool) {
        if !value.is_finite() {
            return (None, true);
        }
        let max = f64::from(self.width.max_raw());
        let sentinel = f64::from(self.width.sentinel());
        let raw = ((value + self.offset) / self.scale).round();

        if raw < 0.0 {
            (Some(0), true)
        } else if raw > sentinel {
            (Some(self.width.max_raw()), true)
        } else {
            // raw == sentinel 时钳位到 sentinel-1，不视为截断
            (Some(raw.min(max) as u32), false)
        }
    }

    fn out_of_range(&self, value: f64) -> CodecError {
        CodecError::FieldOutOfRange {
            field: self.key.clone(),
            value,
            min: self.min_value(),
            max: self.max_value(),
        }
    }
}

/// PGN 定义
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PgnDefinition {
    pub pgn: u32,
    /// 示例仲裁 ID（十六进制），用于界面展示和预设
    pub can_id_hex: String,
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl PgnDefinition {
    pub fn field(&self, key: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// 校验字段布局
    pub fn validate(&self) -> Result<(), CodecError> {
        let invalid = |reason: String| CodecError::InvalidDefinition {
            pgn: self.pgn,
            reason,
        };

        if self.pgn > 0x3_FFFF {
            return Err(invalid(format!("PGN 0x{:X} exceeds 18 bits", self.pgn)));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.byte_offset + field.width.bytes() > 8 {
                return Err(invalid(format!(
                    "field '{}' spans past byte 7 (offset {}, width {})",
                    field.key,
                    field.byte_offset,
                    field.width.bytes()
                )));
            }
            if !(field.scale.is_finite() && field.scale > 0.0) {
                return Err(invalid(format!(
                    "field '{}' has non-positive scale {}",
                    field.key, field.scale
                )));
            }
            if !field.offset.is_finite() {
                return Err(invalid(format!("field '{}' has non-finite offset", field.key)));
            }
            if self.fields[..i].iter().any(|f| f.key == field.key) {
                return Err(invalid(format!("duplicate field key '{}'", field.key)));
            }
        }
        Ok(())
    }
}

/// 解码字段值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Value(f64),
    NotAvailable,
}

impl FieldValue {
    pub fn value(self) -> Option<f64> {
        match self {
            FieldValue::Value(v) => Some(v),
            FieldValue::NotAvailable => None,
        }
    }

    pub fn is_available(self) -> bool {
        matches!(self, FieldValue::Value(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Value(v) => write!(f, "{}", v),
            FieldValue::NotAvailable => f.write_str("N/A"),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FieldValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Value(v) => serializer.serialize_f64(*v),
            FieldValue::NotAvailable => serializer.serialize_str("N/A"),
        }
    }
}

/// 数值或字符串 `"N/A"`
#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FieldValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Value(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Value(v) => Ok(FieldValue::Value(v)),
            Repr::Text(text) if text == "N/A" => Ok(FieldValue::NotAvailable),
            Repr::Text(text) => Err(serde::de::Error::custom(format!(
                "expected a number or \"N/A\", got \"{}\"",
                text
            ))),
        }
    }
}

/// 解码结果
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Decoded {
    pub pgn: u32,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(rename = "sa"))]
    pub source_address: u8,
    pub fields: BTreeMap<String, FieldValue>,
}

/// 截断记录（`encode_lossy` 返回）
#[derive(Debug, Clone, PartialEq)]
pub struct Truncation {
    pub field: String,
    pub requested: f64,
    pub written: f64,
}

/// 编码目标：PGN 号或定义名称
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgnSelector<'a> {
    Number(u32),
    Name(&'a str),
}

impl From<u32> for PgnSelector<'_> {
    fn from(pgn: u32) -> Self {
        PgnSelector::Number(pgn)
    }
}

impl<'a> From<&'a str> for PgnSelector<'a> {
    fn from(name: &'a str) -> Self {
        PgnSelector::Name(name)
    }
}

impl fmt::Display for PgnSelector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgnSelector::Number(pgn) => write!(f, "{}", pgn),
            PgnSelector::Name(name) => f.write_str(name),
        }
    }
}

/// PGN 定义表
///
/// 启动时构建一次，之后只读（可在线程间通过 `Arc` 共享）。
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    by_pgn: BTreeMap<u32, PgnDefinition>,
}

impl CodecRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self::default()
    }

    /// 内置定义
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for def in crate::builtin::definitions() {
            registry.by_pgn.insert(def.pgn, def);
        }
        registry
    }

    /// 由定义列表构建（逐条校验）
    pub fn from_definitions(
        defs: impl IntoIterator<Item = PgnDefinition>,
    ) -> Result<Self, CodecError> {
        let mut registry = Self::empty();
        for def in defs {
            registry.insert(def)?;
        }
        Ok(registry)
    }

    /// 插入或覆盖一个定义
    pub fn insert(&mut self, def: PgnDefinition) -> Result<(), CodecError> {
        def.validate()?;
        self.by_pgn.insert(def.pgn, def);
        Ok(())
    }

    pub fn get(&self, pgn: u32) -> Option<&PgnDefinition> {
        self.by_pgn.get(&pgn)
    }

    /// 按名称查找（忽略大小写）
    pub fn find_by_name(&self, name: &str) -> Option<&PgnDefinition> {
        self.by_pgn
            .values()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    pub fn resolve(&self, selector: PgnSelector<'_>) -> Result<&PgnDefinition, CodecError> {
        let found = match selector {
            PgnSelector::Number(pgn) => self.get(pgn),
            PgnSelector::Name(name) => self.find_by_name(name),
        };
        found.ok_or_else(|| CodecError::UnknownPgn(selector.to_string()))
    }

    pub fn definitions(&self) -> impl Iterator<Item = &PgnDefinition> {
        self.by_pgn.values()
    }

    pub fn len(&self) -> usize {
        self.by_pgn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pgn.is_empty()
    }

    /// 解码一帧
    ///
    /// 没有匹配定义时返回 `CodecError::UnknownPgn`（调用方应视为非致命）。
    pub fn decode(&self, arbitration_id: u32, payload: &[u8; 8]) -> Result<Decoded, CodecError> {
        let id = J1939Id::from_raw(arbitration_id);
        let pgn = id.pgn();
        let def = self
            .get(pgn)
            .ok_or_else(|| CodecError::UnknownPgn(pgn.to_string()))?;

        let fields = def
            .fields
            .iter()
            .map(|f| (f.key.clone(), f.decode(payload)))
            .collect();

        Ok(Decoded {
            pgn,
            name: def.name.clone(),
            source_address: id.source_address(),
            fields,
        })
    }

    /// 严格编码：从全 0xFF 负载开始，仅写入提供的字段
    pub fn encode<'a>(
        &self,
        pgn: impl Into<PgnSelector<'a>>,
        values: &BTreeMap<String, f64>,
    ) -> Result<[u8; 8], CodecError> {
        let def = self.resolve(pgn.into())?;
        let mut payload = [crate::PAD_BYTE; 8];
        for (key, value) in values {
            let field = lookup_field(def, key)?;
            let raw = field.encode_raw(*value)?;
            field.write_raw(&mut payload, raw);
        }
        Ok(payload)
    }

    /// 截断编码：越界值钳位写入，并返回截断列表
    ///
    /// 非有限值（NaN / ∞）仍返回 `FieldOutOfRange`。
    pub fn encode_lossy<'a>(
        &self,
        pgn: impl Into<PgnSelector<'a>>,
        values: &BTreeMap<String, f64>,
    ) -> Result<([u8; 8], Vec<Truncation>), CodecError> {
        let def = self.resolve(pgn.into())?;
        let mut payload = [crate::PAD_BYTE; 8];
        let mut truncations = Vec::new();
        for (key, value) in values {
            let field = lookup_field(def, key)?;
            let (raw, truncated) = field.encode_raw_clamped(*value)?;
            field.write_raw(&mut payload, raw);
            if truncated {
                truncations.push(Truncation {
                    field: key.clone(),
                    requested: *value,
                    written: f64::from(raw) * field.scale - field.offset,
                });
            }
        }
        Ok((payload, truncations))
    }
}

fn lookup_field<'d>(def: &'d PgnDefinition, key: &str) -> Result<&'d FieldDef, CodecError> {
    def.field(key).ok_or_else(|| CodecError::UnknownField {
        pgn: def.pgn,
        field: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_encode_coolant_example() {
        let registry = CodecRegistry::builtin();
        let payload = registry.encode(65262u32, &values(&[("cool", 85.0)])).unwrap();
        assert_eq!(payload[0], 0x7D);
        assert_eq!(&payload[1..], &[0xFF; 7]);

        let decoded = registry.decode(0x18FE_EE00, &payload).unwrap();
        assert_eq!(decoded.name, "Temps");
        assert_eq!(decoded.fields["cool"], FieldValue::Value(85.0));
    }

    #[test]
    fn test_sentinel_byte_decodes_not_available() {
        let registry = CodecRegistry::builtin();
        let decoded = registry.decode(0x18FE_EEFF, &[0xFF; 8]).unwrap();
        assert_eq!(decoded.fields["cool"], FieldValue::NotAvailable);
        assert_eq!(decoded.fields["oil_temp"], FieldValue::NotAvailable);
    }

    #[test]
    fn test_engine_hours_four_byte_field() {
        let registry = CodecRegistry::builtin();
        let payload = registry
            .encode("Engine Hours", &values(&[("hours", 100.0)]))
            .unwrap();
        assert_eq!(&payload[..4], &[0xD0, 0x07, 0x00, 0x00]);

        let decoded = registry.decode(0x18FE_E500, &payload).unwrap();
        let hours = decoded.fields["hours"].value().unwrap();
        assert!((hours - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_reference_frames() {
        let registry = CodecRegistry::builtin();

        let hours = registry
            .decode(0x18FE_E5FF, &[0xA0, 0x86, 0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap();
        assert!((hours.fields["hours"].value().unwrap() - 5000.0).abs() < 1e-9);
        assert_eq!(hours.source_address, 0xFF);

        let temps = registry
            .decode(0x18FE_EEFF, &[0x22, 0x41, 0x60, 0x2D, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap();
        assert_eq!(temps.fields["cool"], FieldValue::Value(-6.0));
        assert_eq!(temps.fields["fuel_temp"], FieldValue::Value(25.0));
        assert!((temps.fields["oil_temp"].value().unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_pgn_is_reported() {
        let registry = CodecRegistry::builtin();
        assert!(matches!(
            registry.decode(0x18FF_0000, &[0; 8]),
            Err(CodecError::UnknownPgn(_))
        ));
        assert!(matches!(
            registry.encode("No Such Group", &BTreeMap::new()),
            Err(CodecError::UnknownPgn(_))
        ));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let registry = CodecRegistry::builtin();
        let err = registry
            .encode(65262u32, &values(&[("boost", 1.0)]))
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownField {
                pgn: 65262,
                field: "boost".into()
            }
        );
    }

    #[test]
    fn test_rounding_onto_sentinel_clamps_one_below() {
        let registry = CodecRegistry::builtin();
        // cool: raw = value + 40; 215 -> 255 (sentinel) -> 254
        let payload = registry.encode(65262u32, &values(&[("cool", 215.0)])).unwrap();
        assert_eq!(payload[0], 0xFE);
        // 214.6 四舍五入为 255，同样取 254
        let payload = registry.encode(65262u32, &values(&[("cool", 214.6)])).unwrap();
        assert_eq!(payload[0], 0xFE);
    }

    #[test]
    fn test_out_of_range_is_an_error() {
        let registry = CodecRegistry::builtin();
        let err = registry
            .encode(65262u32, &values(&[("cool", -41.0)]))
            .unwrap_err();
        assert!(matches!(err, CodecError::FieldOutOfRange { ref field, .. } if field == "cool"));

        let err = registry
            .encode(65262u32, &values(&[("cool", 400.0)]))
            .unwrap_err();
        assert!(matches!(err, CodecError::FieldOutOfRange { .. }));

        let err = registry
            .encode(65262u32, &values(&[("cool", f64::NAN)]))
            .unwrap_err();
        assert!(matches!(err, CodecError::FieldOutOfRange { .. }));
    }

    #[test]
    fn test_encode_lossy_reports_truncation() {
        let registry = CodecRegistry::builtin();
        let (payload, truncations) = registry
            .encode_lossy(65262u32, &values(&[("cool", 400.0), ("fuel_temp", 20.0)]))
            .unwrap();
        assert_eq!(payload[0], 0xFE);
        assert_eq!(payload[1], 60);
        assert_eq!(truncations.len(), 1);
        assert_eq!(truncations[0].field, "cool");
        assert_eq!(truncations[0].written, 214.0);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let def = PgnDefinition {
            pgn: 65000,
            can_id_hex: "18FDE800".into(),
            name: "Bad".into(),
            fields: vec![FieldDef::new("x", "X", "", FieldWidth::Four, 6, 1.0, 0.0)],
        };
        assert!(matches!(
            def.validate(),
            Err(CodecError::InvalidDefinition { pgn: 65000, .. })
        ));

        let def = PgnDefinition {
            fields: vec![FieldDef::new("x", "X", "", FieldWidth::One, 0, 0.0, 0.0)],
            ..def
        };
        assert!(def.validate().is_err());

        let dup = FieldDef::new("x", "X", "", FieldWidth::One, 0, 1.0, 0.0);
        let def = PgnDefinition {
            fields: vec![dup.clone(), FieldDef { byte_offset: 1, ..dup }],
            ..def
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_builtin_definitions_are_valid() {
        for def in CodecRegistry::builtin().definitions() {
            def.validate().unwrap();
        }
    }

    #[test]
    fn test_insert_overrides_existing() {
        let mut registry = CodecRegistry::builtin();
        let mut def = registry.get(65263).unwrap().clone();
        def.fields[1].scale = 2.0;
        registry.insert(def).unwrap();
        assert_eq!(registry.get(65263).unwrap().fields[1].scale, 2.0);
    }

    #[test]
    fn test_field_width_from_primitive() {
        assert_eq!(FieldWidth::try_from(2u8).unwrap(), FieldWidth::Two);
        assert!(FieldWidth::try_from(3u8).is_err());
    }
}
