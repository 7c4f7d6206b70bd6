//! 发送命令
//!
//! 四种来源（互斥）：
//!
//! - `--id 18FEEE00 --data 7D`：原始帧
//! - `--pgn Temps --field cool=85`：按 PGN 定义符号化编码
//! - `--preset "Coolant 85"`：预设文件中的帧
//! - `--request '<json>'`：wire 形状的请求（单个或数组）

use anyhow::{Context, Result};
use busview_driver::wire::PgnRef;
use busview_driver::{Session, TransmitOutcome, TransmitRequest};
use clap::Args;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::modes::oneshot::{ConnectionArgs, OneShotMode};

/// 发送命令参数
#[derive(Args, Debug, Default)]
pub struct SendCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// 仲裁 ID（十六进制；超过 3 位视为扩展帧）
    #[arg(long, requires = "data")]
    pub id: Option<String>,

    /// 负载（十六进制，最多 8 字节，空格可选）
    #[arg(long)]
    pub data: Option<String>,

    /// PGN 号或定义名称
    #[arg(long)]
    pub pgn: Option<String>,

    /// 字段值 key=value（可重复）
    #[arg(short, long = "field", value_parser = parse_field)]
    pub fields: Vec<(String, f64)>,

    /// 源地址（默认 0xFE）
    #[arg(long, value_parser = parse_u8)]
    pub sa: Option<u8>,

    /// 优先级 0..=7（默认 6）
    #[arg(long)]
    pub priority: Option<u8>,

    /// 预设名称
    #[arg(long)]
    pub preset: Option<String>,

    /// JSON 请求
    #[arg(long)]
    pub request: Option<String>,

    /// 重复次数
    #[arg(long, default_value_t = 1)]
    pub repeat: u32,

    /// 两次重复之间的间隔（毫秒）
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    /// 以 JSON 输出每帧结果
    #[arg(long)]
    pub json: bool,
}

fn parse_field(s: &str) -> Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for '{}': {}", key, e))?;
    Ok((key.trim().to_string(), value))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

impl SendCommand {
    /// 把参数转换为请求列表
    pub fn requests(&self, mode: &OneShotMode) -> Result<Vec<TransmitRequest>> {
        let sources = [
            self.id.is_some(),
            self.pgn.is_some(),
            self.preset.is_some(),
            self.request.is_some(),
        ]
        .iter()
        .filter(|&&given| given)
        .count();
        if sources != 1 {
            anyhow::bail!("需要且只能指定一种来源：--id/--data、--pgn、--preset 或 --request");
        }

        if let Some(id) = &self.id {
            let data = self.data.as_deref().unwrap_or_default();
            return Ok(vec![TransmitRequest::raw(id, data)]);
        }

        if let Some(pgn) = &self.pgn {
            let pgn = match pgn.parse::<u32>() {
                Ok(number) => PgnRef::Number(number),
                Err(_) => PgnRef::Name(pgn.clone()),
            };
            let field_values: BTreeMap<String, f64> = self.fields.iter().cloned().collect();
            return Ok(vec![TransmitRequest::Symbolic {
                pgn,
                field_values,
                source_address: self.sa,
                priority: self.priority,
            }]);
        }

        if let Some(name) = &self.preset {
            let preset = mode
                .preset_store()
                .find(name)
                .context("读取预设失败")?
                .ok_or_else(|| anyhow::anyhow!("未找到预设: {}", name))?;
            return Ok(vec![preset.to_request()]);
        }

        let raw = self.request.as_deref().unwrap_or_default();
        match serde_json::from_str::<Vec<TransmitRequest>>(raw) {
            Ok(requests) => Ok(requests),
            Err(_) => Ok(vec![
                serde_json::from_str::<TransmitRequest>(raw).context("无法解析 JSON 请求")?,
            ]),
        }
    }

    pub async fn execute(self, mode: &OneShotMode) -> Result<()> {
        let requests = self.requests(mode)?;
        let (session, _target) = mode.connect(&self.connection)?;

        let repeat = self.repeat.max(1);
        let interval = Duration::from_millis(self.interval_ms);
        let json = self.json;
        let failed = tokio::task::spawn_blocking(move || {
            send_all(&session, &requests, repeat, interval, json)
        })
        .await??;

        if failed > 0 {
            anyhow::bail!("{} 帧发送失败", failed);
        }
        Ok(())
    }
}

fn send_all(
    session: &Session,
    requests: &[TransmitRequest],
    repeat: u32,
    interval: Duration,
    json: bool,
) -> Result<usize> {
    let mut failed = 0;
    for round in 0..repeat {
        if round > 0 {
            std::thread::sleep(interval);
        }
        let outcomes = session.transmit_batch(requests);
        failed += outcomes.iter().filter(|o| !o.ok).count();
        if json {
            println!("{}", serde_json::to_string(&outcomes)?);
        } else {
            outcomes.iter().for_each(print_outcome);
        }
    }
    Ok(failed)
}

fn print_outcome(outcome: &TransmitOutcome) {
    let id = outcome.arbitration_id_hex.as_deref().unwrap_or("-");
    match &outcome.error {
        None => println!("✅ {}", id),
        Some(error) => println!("❌ {}: {}", id, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busview_driver::BusviewConfig;
    use std::fs;
    use tempfile::TempDir;

    fn mode() -> OneShotMode {
        OneShotMode::from_config(BusviewConfig::default())
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_field("cool=85"), Ok(("cool".to_string(), 85.0)));
        assert_eq!(parse_field(" hours = 1.5"), Ok(("hours".to_string(), 1.5)));
        assert!(parse_field("cool").is_err());
        assert!(parse_field("cool=hot").is_err());

        assert_eq!(parse_u8("0x21"), Ok(0x21));
        assert_eq!(parse_u8("254"), Ok(254));
        assert!(parse_u8("256").is_err());
    }

    #[test]
    fn test_raw_request() {
        let cmd = SendCommand {
            id: Some("18FEEE00".into()),
            data: Some("7D".into()),
            ..Default::default()
        };
        assert_eq!(
            cmd.requests(&mode()).unwrap(),
            vec![TransmitRequest::raw("18FEEE00", "7D")]
        );
    }

    #[test]
    fn test_symbolic_request() {
        let cmd = SendCommand {
            pgn: Some("65262".into()),
            fields: vec![("cool".into(), 85.0)],
            sa: Some(0x21),
            ..Default::default()
        };
        match &cmd.requests(&mode()).unwrap()[0] {
            TransmitRequest::Symbolic {
                pgn,
                field_values,
                source_address,
                priority,
            } => {
                assert_eq!(pgn, &PgnRef::Number(65262));
                assert_eq!(field_values["cool"], 85.0);
                assert_eq!(*source_address, Some(0x21));
                assert_eq!(*priority, None);
            },
            other => panic!("expected symbolic request, got {:?}", other),
        }
    }

    #[test]
    fn test_json_request_list() {
        let cmd = SendCommand {
            request: Some(
                r#"[{"arbitrationIdHex":"123","payloadHex":"00"},
                    {"pgn":"Temps","fieldValues":{"cool":20}}]"#
                    .into(),
            ),
            ..Default::default()
        };
        let requests = cmd.requests(&mode()).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], TransmitRequest::raw("123", "00"));
    }

    #[test]
    fn test_preset_request() {
        let dir = TempDir::new().unwrap();
        let presets = dir.path().join("presets.json");
        fs::write(
            &presets,
            r#"{"presets":[{"name":"Hot","id_hex":"18FEEE00","data_hex":"7D"}]}"#,
        )
        .unwrap();
        let mut config = BusviewConfig::default();
        config.paths.presets = Some(presets);
        let mode = OneShotMode::from_config(config);

        let cmd = SendCommand {
            preset: Some("Hot".into()),
            ..Default::default()
        };
        assert_eq!(
            cmd.requests(&mode).unwrap(),
            vec![TransmitRequest::raw("18FEEE00", "7D")]
        );

        let missing = SendCommand {
            preset: Some("Cold".into()),
            ..Default::default()
        };
        assert!(missing.requests(&mode).is_err());
    }

    #[test]
    fn test_requires_exactly_one_source() {
        assert!(SendCommand::default().requests(&mode()).is_err());
        let both = SendCommand {
            id: Some("123".into()),
            data: Some("00".into()),
            pgn: Some("Temps".into()),
            ..Default::default()
        };
        assert!(both.requests(&mode()).is_err());
    }

    #[test]
    fn test_send_over_loopback() {
        let mode = mode();
        let connection = ConnectionArgs {
            interface: Some("cli-send".into()),
            backend: Some(busview_can::BackendKind::Loopback),
            ..Default::default()
        };
        let (session, _) = mode.connect(&connection).unwrap();
        let failed = send_all(
            &session,
            &[
                TransmitRequest::raw("18FEEE00", "7D"),
                TransmitRequest::raw("18FEEE00", "not hex"),
            ],
            2,
            Duration::ZERO,
            false,
        )
        .unwrap();
        assert_eq!(failed, 2);
        assert_eq!(session.health().metrics.tx_frames, 2);
    }
}
