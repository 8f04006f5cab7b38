// dispatcher.rs
// 分派器：在一台设备上执行一次任务尝试，并对结果分类。
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::Device;
use crate::error::ExecError;
use crate::executor::{RemoteCommand, RemoteExecutor, RemoteTarget};
use crate::task::{TaskId, Work};

/// 远端 worker 从 stdin 读取的任务信封
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub task_id: TaskId,
    pub work: &'a Work,
}

/// 远端 worker 在 stdout 输出的应答
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Reply {
    Ok(serde_json::Value),
    Error(String),
}

/// 一次分派的分类结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// 执行成功并返回结果
    Success(serde_json::Value),
    /// 执行失败，但设备本身正常
    RemoteError(String),
    /// 设备不可达、通道断开或超过截止时间
    Unreachable(String),
}

impl DispatchOutcome {
    pub fn is_device_fault(&self) -> bool {
        matches!(self, DispatchOutcome::Unreachable(_))
    }
}

/// 把任务信封发送到设备
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn RemoteExecutor>,
    worker_command: String,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn RemoteExecutor>, worker_command: impl Into<String>) -> Self {
        Self {
            executor,
            worker_command: worker_command.into(),
        }
    }

    pub async fn execute(
        &self,
        task_id: TaskId,
        work: &Work,
        device: &Device,
        deadline: Duration,
    ) -> DispatchOutcome {
        let payload = match serde_json::to_vec(&Envelope { task_id, work }) {
            Ok(payload) => payload,
            Err(e) => return DispatchOutcome::RemoteError(format!("cannot serialize task: {}", e)),
        };
        let command = RemoteCommand::new(&self.worker_command, deadline).with_stdin(payload);
        debug!(%task_id, device = %device.name, ?deadline, "dispatching");

        match self.executor.execute(&RemoteTarget::from(device), &command).await {
            Ok(output) => {
                let reply = output
                    .stdout
                    .lines()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .and_then(|line| serde_json::from_str::<Reply>(line).ok());
                match (reply, output.success()) {
                    (Some(Reply::Ok(value)), true) => DispatchOutcome::Success(value),
                    (Some(Reply::Error(message)), _) => DispatchOutcome::RemoteError(message),
                    (Some(Reply::Ok(_)), false) | (None, _) => DispatchOutcome::RemoteError(format!(
                        "worker exited with status {} without a valid reply: {}",
                        output.exit_status,
                        output.stderr.trim()
                    )),
                }
            }
            Err(e @ ExecError::Timeout(_)) => {
                DispatchOutcome::Unreachable(format!("deadline exceeded: {}", e))
            }
            Err(e) => DispatchOutcome::Unreachable(e.to_string()),
        }
    }
}
