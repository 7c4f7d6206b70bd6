//! 离线解码命令
//!
//! 不连接总线，按当前配置（含 `[[pgn]]` 覆盖）解码一帧或列出已知 PGN。

use anyhow::{Context, Result};
use busview_protocol::{BusFrame, CodecError, CodecRegistry, J1939Id};
use clap::Args;

use crate::modes::oneshot::OneShotMode;

/// 解码命令参数
#[derive(Args, Debug)]
pub struct DecodeCommand {
    /// 仲裁 ID（十六进制）
    #[arg(required_unless_present = "list")]
    pub id: Option<String>,

    /// 负载（十六进制）
    #[arg(required_unless_present = "list")]
    pub data: Option<String>,

    /// 列出已知 PGN 定义
    #[arg(long)]
    pub list: bool,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

impl DecodeCommand {
    pub fn execute(self, mode: &OneShotMode) -> Result<()> {
        let registry = mode.registry()?;

        if self.list {
            if self.json {
                let defs: Vec<_> = registry.definitions().collect();
                println!("{}", serde_json::to_string_pretty(&defs)?);
            } else {
                list_definitions(&registry);
            }
            return Ok(());
        }

        let (Some(id), Some(data)) = (self.id.as_deref(), self.data.as_deref()) else {
            anyhow::bail!("需要 ID 和负载");
        };
        let frame = BusFrame::from_hex(id, data).context("无效的帧")?;
        let output = describe(&registry, &frame)?;
        if self.json {
            let decoded = registry.decode(frame.id(), frame.data()).ok();
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        } else {
            print!("{}", output);
        }
        Ok(())
    }
}

fn list_definitions(registry: &CodecRegistry) {
    for def in registry.definitions() {
        println!("{:>6}  {:<8}  {}", def.pgn, def.can_id_hex, def.name);
        for field in &def.fields {
            println!(
                "          {:<16} {:<28} 字节 {}..{}  {}",
                field.key,
                field.label,
                field.byte_offset,
                field.byte_offset + field.width.bytes(),
                field.unit
            );
        }
    }
}

/// 帧的文字描述（J1939 分解 + 字段值）
fn describe(registry: &CodecRegistry, frame: &BusFrame) -> Result<String> {
    let mut out = format!("{} [{}] {}\n", frame.id_hex(), frame.len(), frame.payload_hex());
    if !frame.is_extended() {
        out.push_str("  标准帧，无 J1939 解码\n");
        return Ok(out);
    }

    let id = J1939Id::from_raw(frame.id());
    out.push_str(&format!(
        "  优先级 {}  PGN {}  源地址 0x{:02X}\n",
        id.priority().value(),
        id.pgn(),
        id.source_address()
    ));

    match registry.decode(frame.id(), frame.data()) {
        Ok(decoded) => {
            out.push_str(&format!("  {}\n", decoded.name));
            let def = registry.get(decoded.pgn);
            for (key, value) in &decoded.fields {
                let (label, unit) = def
                    .and_then(|d| d.field(key))
                    .map(|f| (f.label.as_str(), f.unit.as_str()))
                    .unwrap_or((key.as_str(), ""));
                if value.is_available() {
                    out.push_str(&format!("    {:<28} {} {}\n", label, value, unit));
                } else {
                    out.push_str(&format!("    {:<28} {}\n", label, value));
                }
            }
        },
        Err(CodecError::UnknownPgn(pgn)) => out.push_str(&format!("  未知 PGN {}\n", pgn)),
        Err(e) => return Err(e.into()),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_known_pgn() {
        let registry = CodecRegistry::builtin();
        let frame = BusFrame::from_hex("18FEEE00", "7D").unwrap();
        let text = describe(&registry, &frame).unwrap();

        assert!(text.contains("PGN 65262"));
        assert!(text.contains("Temps"));
        assert!(text.contains("Coolant Temp"));
        assert!(text.contains("85 °C"));
        assert!(text.contains("N/A"));
    }

    #[test]
    fn test_describe_unknown_and_standard() {
        let registry = CodecRegistry::builtin();
        let unknown = BusFrame::from_hex("18F11CEF", "A55A").unwrap();
        let text = describe(&registry, &unknown).unwrap();
        assert!(text.contains("源地址 0xEF"));
        assert!(text.contains("未知 PGN"));

        let standard = BusFrame::from_hex("123", "00").unwrap();
        assert!(describe(&registry, &standard).unwrap().contains("标准帧"));
    }
}
