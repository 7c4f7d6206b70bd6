//! 预设帧与分组（只读）
//!
//! 兼容两种预设文档：
//!
//! ```json
//! {"presets": [{"name": "Coolant 85", "id_hex": "18FEEE00", "data_hex": "7DFFFFFFFFFFFFFF"}]}
//! {"frames":  [{"name": "Coolant 85", "id_hex": "18FEEE00", "data_hex": "7DFFFFFFFFFFFFFF"}]}
//! ```
//!
//! 分组文档为 `{"groups": [{"name": ..., "frames": [...]}]}`。
//! 文件不存在视为空列表；缺少 `id_hex` 或 `data_hex` 的条目被跳过。

use crate::error::PresetError;
use crate::wire::TransmitRequest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preset {
    /// 未命名条目使用 `id_hex`
    pub name: String,
    pub id_hex: String,
    pub data_hex: String,
}

impl Preset {
    pub fn to_request(&self) -> TransmitRequest {
        TransmitRequest::raw(&self.id_hex, &self.data_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresetGroup {
    pub name: String,
    pub frames: Vec<Preset>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPreset {
    name: Option<String>,
    id_hex: Option<String>,
    data_hex: Option<String>,
}

impl RawPreset {
    fn into_preset(self) -> Option<Preset> {
        let id_hex = self.id_hex?;
        let data_hex = self.data_hex?;
        Some(Preset {
            name: self.name.unwrap_or_else(|| id_hex.clone()),
            id_hex,
            data_hex,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct PresetDocument {
    presets: Option<Vec<RawPreset>>,
    frames: Option<Vec<RawPreset>>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    #[serde(default)]
    name: String,
    #[serde(default)]
    frames: Vec<RawPreset>,
}

#[derive(Debug, Default, Deserialize)]
struct GroupDocument {
    #[serde(default)]
    groups: Vec<RawGroup>,
}

fn collect(entries: Vec<RawPreset>) -> Vec<Preset> {
    entries.into_iter().filter_map(RawPreset::into_preset).collect()
}

/// 基于 JSON 文件的预设存储
#[derive(Debug, Clone)]
pub struct JsonPresetStore {
    presets_path: PathBuf,
    groups_path: PathBuf,
}

impl JsonPresetStore {
    pub fn new(presets_path: impl Into<PathBuf>, groups_path: impl Into<PathBuf>) -> Self {
        Self {
            presets_path: presets_path.into(),
            groups_path: groups_path.into(),
        }
    }

    pub fn presets_path(&self) -> &Path {
        &self.presets_path
    }

    pub fn groups_path(&self) -> &Path {
        &self.groups_path
    }

    pub fn list(&self) -> Result<Vec<Preset>, PresetError> {
        let Some(document) = read_document::<PresetDocument>(&self.presets_path)? else {
            return Ok(Vec::new());
        };
        // 两种形状同时存在时以 presets 为准
        let entries = document.presets.or(document.frames).unwrap_or_default();
        let presets = collect(entries);
        debug!(
            "Loaded {} preset(s) from {}",
            presets.len(),
            self.presets_path.display()
        );
        Ok(presets)
    }

    pub fn groups(&self) -> Result<Vec<PresetGroup>, PresetError> {
        let Some(document) = read_document::<GroupDocument>(&self.groups_path)? else {
            return Ok(Vec::new());
        };
        Ok(document
            .groups
            .into_iter()
            .map(|group| PresetGroup {
                name: group.name,
                frames: collect(group.frames),
            })
            .collect())
    }

    /// 按名称查找预设
    pub fn find(&self, name: &str) -> Result<Option<Preset>, PresetError> {
        Ok(self.list()?.into_iter().find(|p| p.name == name))
    }
}

/// 读取并解析文档；文件不存在返回 `None`，非对象文档视为空
fn read_document<T>(path: &Path) -> Result<Option<T>, PresetError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PresetError::Io(e)),
    };
    let value: serde_json::Value = serde_json::from_str(&content)?;
    if !value.is_object() {
        return Ok(Some(T::default()));
    }
    Ok(Some(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> JsonPresetStore {
        JsonPresetStore::new(dir.path().join("presets.json"), dir.path().join("groups.json"))
    }

    #[test]
    fn test_missing_files_are_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.list().unwrap().is_empty());
        assert!(store.groups().unwrap().is_empty());
    }

    #[test]
    fn test_presets_shape() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(
            store.presets_path(),
            r#"{"presets": [
                {"name": "Coolant 85", "id_hex": "18FEEE00", "data_hex": "7D"},
                {"name": "broken", "id_hex": "18FEEE00"},
                {"id_hex": "123", "data_hex": "00"}
            ]}"#,
        )
        .unwrap();

        let presets = store.list().unwrap();
        assert_eq!(presets.len(), 2);
        assert_eq!(presets[0].name, "Coolant 85");
        assert_eq!(presets[1].name, "123");
        assert_eq!(presets[0].to_request(), TransmitRequest::raw("18FEEE00", "7D"));
        assert_eq!(store.find("123").unwrap(), Some(presets[1].clone()));
        assert_eq!(store.find("nope").unwrap(), None);
    }

    #[test]
    fn test_frames_shape() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(
            store.presets_path(),
            r#"{"frames": [{"name": "Hours", "id_hex": "18FEE500", "data_hex": "D0070000"}]}"#,
        )
        .unwrap();
        let presets = store.list().unwrap();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].id_hex, "18FEE500");
    }

    #[test]
    fn test_non_object_document_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.presets_path(), "[]").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_document() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.presets_path(), "{not json").unwrap();
        assert!(matches!(store.list(), Err(PresetError::Json(_))));
    }

    #[test]
    fn test_groups() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(
            store.groups_path(),
            r#"{"groups": [{"name": "Warmup", "frames": [
                {"name": "Cold", "id_hex": "18FEEE00", "data_hex": "28"},
                {"name": "Hot", "id_hex": "18FEEE00", "data_hex": "7D"}
            ]}]}"#,
        )
        .unwrap();
        let groups = store.groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Warmup");
        let names: Vec<&str> = groups[0].frames.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Cold", "Hot"]);
    }
}
