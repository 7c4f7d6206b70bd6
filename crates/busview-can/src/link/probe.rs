//! 只读链路状态查询（`ip -details -json link show`）

use super::{CommandRunner, LinkError, LinkState, classify_failure};
use serde_json::Value;
use std::sync::Arc;

/// 某一时刻的链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub state: LinkState,
    pub bitrate: Option<u32>,
}

pub trait LinkProbe: Send + Sync {
    /// 接口不存在时返回 `Ok(None)`
    fn probe(&self, name: &str) -> Result<Option<LinkStatus>, LinkError>;
}

pub struct IpLinkProbe {
    runner: Arc<dyn CommandRunner>,
}

impl IpLinkProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl LinkProbe for IpLinkProbe {
    fn probe(&self, name: &str) -> Result<Option<LinkStatus>, LinkError> {
        let args: Vec<String> = ["-details", "-json", "link", "show", "dev", name]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.runner.run("ip", &args)?;
        if !output.success {
            return match classify_failure(&output) {
                LinkError::DeviceNotFound(_) => Ok(None),
                other => Err(other),
            };
        }
        Ok(parse_link_list(&output.stdout)
            .into_iter()
            .find(|(ifname, _)| ifname == name)
            .map(|(_, status)| status))
    }
}

/// 解析 `ip -details -json link show` 的输出
///
/// 管理状态看 `flags` 中的 `UP`（vcan 的 operstate 恒为 `UNKNOWN`）；
/// CAN 控制器处于 `BUS-OFF` 时视为 `Error`。
pub(crate) fn parse_link_list(json: &str) -> Vec<(String, LinkStatus)> {
    let Ok(Value::Array(links)) = serde_json::from_str::<Value>(json) else {
        return Vec::new();
    };

    links
        .iter()
        .filter_map(|link| {
            let name = link.get("ifname")?.as_str()?.to_string();
            let is_up = link
                .get("flags")
                .and_then(Value::as_array)
                .is_some_and(|flags| flags.iter().any(|f| f.as_str() == Some("UP")));
            let info_data = link.get("linkinfo").and_then(|l| l.get("info_data"));
            let bus_off = info_data
                .and_then(|d| d.get("state"))
                .and_then(Value::as_str)
                .is_some_and(|s| s == "BUS-OFF");
            let bitrate = info_data
                .and_then(|d| d.get("bittiming"))
                .and_then(|b| b.get("bitrate"))
                .and_then(Value::as_u64)
                .and_then(|b| u32::try_from(b).ok());

            let state = match (is_up, bus_off) {
                (_, true) => LinkState::Error,
                (true, false) => LinkState::Up,
                (false, false) => LinkState::Down,
            };
            Some((name, LinkStatus { state, bitrate }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"ifindex":3,"ifname":"vcan0","flags":["NOARP","UP","LOWER_UP"],"operstate":"UNKNOWN",
         "linkinfo":{"info_kind":"vcan"}},
        {"ifindex":4,"ifname":"can0","flags":["NOARP","ECHO"],"operstate":"DOWN",
         "linkinfo":{"info_kind":"can","info_data":{"state":"STOPPED",
            "bittiming":{"bitrate":250000,"sample_point":"0.875"}}}},
        {"ifindex":5,"ifname":"can1","flags":["NOARP","UP","ECHO"],"operstate":"UP",
         "linkinfo":{"info_kind":"can","info_data":{"state":"BUS-OFF",
            "bittiming":{"bitrate":500000}}}}
    ]"#;

    #[test]
    fn test_parse_link_list() {
        let links = parse_link_list(SAMPLE);
        assert_eq!(links.len(), 3);
        assert_eq!(
            links[0],
            (
                "vcan0".to_string(),
                LinkStatus {
                    state: LinkState::Up,
                    bitrate: None
                }
            )
        );
        assert_eq!(links[1].1.state, LinkState::Down);
        assert_eq!(links[1].1.bitrate, Some(250_000));
        assert_eq!(links[2].1.state, LinkState::Error);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_link_list("not json").is_empty());
        assert!(parse_link_list("{}").is_empty());
    }
}
