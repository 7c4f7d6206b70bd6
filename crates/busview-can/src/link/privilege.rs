//! 命令执行与权限策略

use super::{LinkError, LinkStep, classify_failure};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, trace};

/// 子进程执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub program: String,
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// 子进程执行接缝（测试中替换为脚本化的假实现）
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, LinkError>;
}

/// 基于 `std::process::Command` 的执行器
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, LinkError> {
        trace!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LinkError::Unsupported(format!("'{}' not found in PATH", program))
            } else {
                LinkError::Io(format!("failed to run {}: {}", program, e))
            }
        })?;
        Ok(CommandOutput {
            program: program.to_string(),
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// 执行一组链路步骤的权限路径
pub trait PrivilegeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 执行全部步骤
    ///
    /// 只有返回 `LinkError::PermissionDenied` 时，调用方才会尝试下一个策略。
    fn apply(&self, steps: &[LinkStep]) -> Result<(), LinkError>;
}

/// 以当前进程权限逐步执行
pub struct DirectExec {
    runner: Arc<dyn CommandRunner>,
}

impl DirectExec {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl PrivilegeStrategy for DirectExec {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn apply(&self, steps: &[LinkStep]) -> Result<(), LinkError> {
        for step in steps {
            let (program, args) = step.command();
            let output = self.runner.run(program, &args)?;
            if output.success {
                continue;
            }
            if step.tolerates(&output.stderr) {
                debug!("Ignoring failed step {:?}: {}", step, output.stderr.trim());
                continue;
            }
            return Err(classify_failure(&output));
        }
        Ok(())
    }
}

/// 通过交互式提权（`pkexec sh -c <script>`）一次性执行全部步骤
pub struct ElevatedExec {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl ElevatedExec {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_program(runner, "pkexec")
    }

    pub fn with_program(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// 构建提权脚本；接口名已由 `validate_name` 限定为安全字符
    pub(crate) fn script(steps: &[LinkStep]) -> String {
        let mut lines = vec!["set -e".to_string()];
        for step in steps {
            let (program, args) = step.command();
            let line = format!("{} {}", program, args.join(" "));
            match step {
                LinkStep::LoadVcanModule => lines.push(format!("{} || true", line)),
                LinkStep::AddVirtual { name } => lines.push(format!(
                    "ip link show dev {} >/dev/null 2>&1 || {}",
                    name, line
                )),
                _ => lines.push(line),
            }
        }
        lines.join("\n")
    }
}

impl PrivilegeStrategy for ElevatedExec {
    fn name(&self) -> &'static str {
        "elevated"
    }

    fn apply(&self, steps: &[LinkStep]) -> Result<(), LinkError> {
        if steps.is_empty() {
            return Ok(());
        }
        let args = vec!["sh".to_string(), "-c".to_string(), Self::script(steps)];
        let output = self.runner.run(&self.program, &args)?;
        if output.success {
            Ok(())
        } else {
            Err(classify_failure(&output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_script() {
        let script = ElevatedExec::script(&[
            LinkStep::LoadVcanModule,
            LinkStep::AddVirtual {
                name: "vcan0".into(),
            },
            LinkStep::SetUp {
                name: "vcan0".into(),
            },
        ]);
        assert_eq!(
            script,
            "set -e\n\
             modprobe vcan || true\n\
             ip link show dev vcan0 >/dev/null 2>&1 || ip link add dev vcan0 type vcan\n\
             ip link set vcan0 up"
        );
    }

    #[test]
    fn test_system_runner_missing_program() {
        let err = SystemRunner
            .run("definitely-not-a-real-binary-xyz", &[])
            .unwrap_err();
        assert!(matches!(err, LinkError::Unsupported(_)));
    }
}
