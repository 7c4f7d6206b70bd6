//! 接口 bring-up / tear-down
//!
//! 同一接口名的并发 bring-up 合并为一次执行（single-flight），后到的调用者
//! 等待并共享第一次执行的结果；不同接口名之间互不阻塞。

use super::{
    CommandRunner, DirectExec, ElevatedExec, InterfaceKind, IpLinkProbe, LinkError, LinkProbe,
    LinkState, LinkStep, PrivilegeStrategy, SystemRunner, validate_name,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

type FlightResult = Result<LinkState, LinkError>;

#[derive(Default)]
struct Flight {
    result: Mutex<Option<FlightResult>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> FlightResult {
        let mut result = self.result.lock();
        while result.is_none() {
            self.done.wait(&mut result);
        }
        result
            .clone()
            .unwrap_or_else(|| Err(LinkError::Io("bring-up aborted".into())))
    }

    fn complete(&self, value: FlightResult) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(value);
        }
        self.done.notify_all();
    }
}

/// 领头调用者离开时（包括 panic）清理飞行表并唤醒等待者
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<String, Arc<Flight>>>,
    name: &'a str,
    flight: Arc<Flight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flights.lock().remove(self.name);
        self.flight
            .complete(Err(LinkError::Io("bring-up aborted".into())));
    }
}

pub struct LifecycleManager {
    strategies: Vec<Box<dyn PrivilegeStrategy>>,
    probe: Box<dyn LinkProbe>,
    /// 当前平台是否支持链路管理
    managed: bool,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl LifecycleManager {
    /// 系统默认配置：先直接执行 `ip`，权限不足时回退到 `pkexec`
    pub fn system() -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Self {
            strategies: vec![
                Box::new(DirectExec::new(Arc::clone(&runner))),
                Box::new(ElevatedExec::new(Arc::clone(&runner))),
            ],
            probe: Box::new(IpLinkProbe::new(runner)),
            managed: cfg!(target_os = "linux"),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// 使用自定义策略与探测器（始终视为可管理平台）
    pub fn with_parts(strategies: Vec<Box<dyn PrivilegeStrategy>>, probe: Box<dyn LinkProbe>) -> Self {
        Self {
            strategies,
            probe,
            managed: true,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// 启动接口
    ///
    /// - 虚拟接口：不存在则创建，然后置为 UP；`bitrate` 被忽略
    /// - 物理接口：DOWN → 配置波特率 → UP，完成后重新探测并核对波特率
    /// - 厂商接口或不支持链路管理的平台：直接返回 `Up`
    pub fn bring_up(&self, name: &str, bitrate: Option<u32>) -> Result<LinkState, LinkError> {
        validate_name(name)?;
        let kind = InterfaceKind::classify(name);
        if !self.managed || kind == InterfaceKind::Vendor {
            debug!("Link management skipped for '{}' ({})", name, kind);
            return Ok(LinkState::Up);
        }

        let (flight, leader) = {
            let mut flights = self.flights.lock();
            match flights.get(name) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    flights.insert(name.to_string(), Arc::clone(&flight));
                    (flight, true)
                },
            }
        };

        if !leader {
            debug!("Bring-up of '{}' already in flight, waiting", name);
            return flight.wait();
        }

        let guard = FlightGuard {
            flights: &self.flights,
            name,
            flight,
        };
        let result = match kind {
            InterfaceKind::Virtual => self.bring_up_virtual(name, bitrate),
            _ => self.bring_up_physical(name, bitrate),
        };
        match &result {
            Ok(state) => info!("Bring-up of '{}' finished: {}", name, state),
            Err(e) => warn!("Bring-up of '{}' failed: {}", name, e),
        }
        guard.flight.complete(result.clone());
        result
    }

    /// 将接口置为 DOWN
    pub fn bring_down(&self, name: &str) -> Result<LinkState, LinkError> {
        validate_name(name)?;
        if !self.managed || InterfaceKind::classify(name) == InterfaceKind::Vendor {
            return Ok(LinkState::Down);
        }
        if self.probe.probe(name)?.is_none() {
            return Err(LinkError::DeviceNotFound(name.to_string()));
        }
        self.apply(&[LinkStep::SetDown {
            name: name.to_string(),
        }])?;
        self.status(name)
    }

    /// 只读查询；bring-up 进行中时返回 `Configuring`
    pub fn status(&self, name: &str) -> Result<LinkState, LinkError> {
        validate_name(name)?;
        if self.flights.lock().contains_key(name) {
            return Ok(LinkState::Configuring);
        }
        if !self.managed || InterfaceKind::classify(name) == InterfaceKind::Vendor {
            return Ok(LinkState::Up);
        }
        match self.probe.probe(name)? {
            Some(status) => Ok(status.state),
            None => Err(LinkError::DeviceNotFound(name.to_string())),
        }
    }

    fn bring_up_virtual(&self, name: &str, bitrate: Option<u32>) -> FlightResult {
        if let Some(bitrate) = bitrate {
            debug!("Ignoring bitrate {} for virtual link '{}'", bitrate, name);
        }
        let existing = self.probe.probe(name)?;
        let mut steps = Vec::new();
        if existing.is_none() {
            steps.push(LinkStep::LoadVcanModule);
            steps.push(LinkStep::AddVirtual {
                name: name.to_string(),
            });
        }
        if existing.is_none_or(|s| s.state != LinkState::Up) {
            steps.push(LinkStep::SetUp {
                name: name.to_string(),
            });
        }
        self.apply(&steps)?;
        self.final_state(name, None)
    }

    fn bring_up_physical(&self, name: &str, bitrate: Option<u32>) -> FlightResult {
        if self.probe.probe(name)?.is_none() {
            return Err(LinkError::DeviceNotFound(name.to_string()));
        }
        // 在线链路上修改波特率会被驱动拒绝，必须先 DOWN
        let mut steps = vec![LinkStep::SetDown {
            name: name.to_string(),
        }];
        if let Some(bitrate) = bitrate {
            steps.push(LinkStep::ConfigureCan {
                name: name.to_string(),
                bitrate,
            });
        }
        steps.push(LinkStep::SetUp {
            name: name.to_string(),
        });
        self.apply(&steps)?;
        self.final_state(name, bitrate)
    }

    fn final_state(&self, name: &str, expected_bitrate: Option<u32>) -> FlightResult {
        let status = self
            .probe
            .probe(name)?
            .ok_or_else(|| LinkError::DeviceNotFound(name.to_string()))?;
        if let (Some(expected), Some(actual)) = (expected_bitrate, status.bitrate)
            && expected != actual
        {
            return Err(LinkError::DriverRejected(format!(
                "'{}' reports bitrate {} after requesting {}",
                name, actual, expected
            )));
        }
        Ok(status.state)
    }

    /// 按顺序尝试各权限策略，仅在权限不足时回退
    fn apply(&self, steps: &[LinkStep]) -> Result<(), LinkError> {
        if steps.is_empty() {
            return Ok(());
        }
        let mut denied = None;
        for strategy in &self.strategies {
            match strategy.apply(steps) {
                Ok(()) => {
                    debug!("Applied {} link step(s) via {}", steps.len(), strategy.name());
                    return Ok(());
                },
                Err(LinkError::PermissionDenied(detail)) => {
                    warn!("{} execution denied: {}", strategy.name(), detail);
                    denied = Some(detail);
                },
                Err(e) => return Err(e),
            }
        }
        Err(LinkError::PermissionDenied(
            denied.unwrap_or_else(|| "no privilege strategy available".to_string()),
        ))
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::system()
    }
}
