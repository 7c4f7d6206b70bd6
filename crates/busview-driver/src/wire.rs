//! 对外 JSON 形状（camelCase）
//!
//! ```json
//! {"timestamp":1.25,"arbitrationIdHex":"18FEEE00","dataLengthCode":8,
//!  "payloadHex":"7DFFFFFFFFFFFFFF","direction":"rx",
//!  "decoded":{"pgn":65262,"name":"Temps","sa":0,"fields":{"cool":85.0,"fuel_temp":"N/A"}}}
//! ```

use crate::hub::{HubEvent, ReceivedFrame};
use crate::session::HealthSnapshot;
use busview_can::{LifecycleManager, LinkError, LinkState};
use busview_protocol::{Decoded, Direction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 推送给观察者的帧
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFrame {
    pub timestamp: f64,
    pub arbitration_id_hex: String,
    pub data_length_code: u8,
    pub payload_hex: String,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<Decoded>,
}

impl From<&ReceivedFrame> for WireFrame {
    fn from(received: &ReceivedFrame) -> Self {
        let frame = &received.frame;
        Self {
            timestamp: frame.timestamp(),
            arbitration_id_hex: frame.id_hex(),
            data_length_code: frame.len(),
            payload_hex: frame.payload_hex(),
            direction: frame.direction(),
            decoded: received.decoded.clone(),
        }
    }
}

/// PGN 号或定义名称
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PgnRef {
    Number(u32),
    Name(String),
}

/// 发送请求：原始帧或符号化字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransmitRequest {
    #[serde(rename_all = "camelCase")]
    Raw {
        arbitration_id_hex: String,
        payload_hex: String,
    },
    #[serde(rename_all = "camelCase")]
    Symbolic {
        pgn: PgnRef,
        field_values: BTreeMap<String, f64>,
        /// 默认 0xFE（J1939 空地址）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_address: Option<u8>,
        /// 默认 6
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<u8>,
    },
}

impl TransmitRequest {
    pub fn raw(arbitration_id_hex: impl Into<String>, payload_hex: impl Into<String>) -> Self {
        TransmitRequest::Raw {
            arbitration_id_hex: arbitration_id_hex.into(),
            payload_hex: payload_hex.into(),
        }
    }

    pub fn symbolic(pgn: PgnRef, field_values: BTreeMap<String, f64>) -> Self {
        TransmitRequest::Symbolic {
            pgn,
            field_values,
            source_address: None,
            priority: None,
        }
    }
}

/// 批量发送中单个请求的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmitOutcome {
    /// 实际发送的 ID；请求在编码阶段失败时为 `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arbitration_id_hex: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BringUpRequest {
    pub interface_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

impl BringUpRequest {
    /// 执行启动流程（阻塞，可能等待子进程或提权确认）
    pub fn execute(&self, manager: &LifecycleManager) -> BringUpResult {
        BringUpResult::from(manager.bring_up(&self.interface_name, self.bitrate))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BringUpResult {
    pub ok: bool,
    pub resulting_link_state: LinkState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<Result<LinkState, LinkError>> for BringUpResult {
    fn from(result: Result<LinkState, LinkError>) -> Self {
        match result {
            Ok(state) => Self {
                ok: state == LinkState::Up,
                resulting_link_state: state,
                detail: None,
            },
            Err(e) => {
                // 驱动拒绝或执行中断时链路可能停在中间状态
                let state = match e {
                    LinkError::DriverRejected(_) | LinkError::Io(_) => LinkState::Error,
                    _ => LinkState::Down,
                };
                Self {
                    ok: false,
                    resulting_link_state: state,
                    detail: Some(e.to_string()),
                }
            },
        }
    }
}

/// 观察者事件流
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    Frame(WireFrame),
    EndOfStream { reason: String },
    Health(HealthSnapshot),
}

impl From<&HubEvent> for StreamEvent {
    fn from(event: &HubEvent) -> Self {
        match event {
            HubEvent::Frame(received) => StreamEvent::Frame(WireFrame::from(received.as_ref())),
            HubEvent::EndOfStream { reason } => StreamEvent::EndOfStream {
                reason: reason.clone(),
            },
        }
    }
}
