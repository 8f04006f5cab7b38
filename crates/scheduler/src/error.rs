// error.rs
// 定义项目通用的错误类型与 Result，以及探测、远程执行各自的错误类型。
use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskId;

/// 一次 `RemoteExecutor` 调用的失败
///
/// 每个变体都表示设备不可达或通道中断；命令执行了但失败的情况通过退出码返回。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// 无法建立通道
    #[error("connection failed: {0}")]
    Connect(String),
    /// 调用超过截止时间
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// 命令运行中通道断开
    #[error("channel dropped: {0}")]
    Dropped(String),
}

/// 设备探测拒绝设备的原因
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// 连接超时内无法连上设备
    #[error("cannot reach device: {0}")]
    Connection(String),
    /// 加速器列表为空或格式错误
    #[error("accelerator enumeration failed: {0}")]
    Enumeration(String),
    /// 某个加速器未通过功能检查
    #[error("accelerator {index} failed its smoke test: {reason}")]
    AcceleratorFault { index: u32, reason: String },
}

/// 任务的一次失败分派，最终失败时一并报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 执行该次尝试的设备
    pub device: String,
    /// 失败原因
    pub reason: String,
    /// 是否归咎于设备
    pub device_fault: bool,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.device_fault { "device" } else { "remote" };
        write!(f, "{} ({}): {}", self.device, kind, self.reason)
    }
}

/// 项目通用错误类型，注册表、调度器与训练模块共用
#[derive(Debug, Error)]
pub enum Error {
    /// IO错误
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// 序列化错误
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// 设备条目或配置文件解析失败
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// 同名设备已注册
    #[error("device '{0}' is already registered")]
    DuplicateDevice(String),
    /// 没有该名称的设备
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    /// 该设备正在探测中
    #[error("device '{0}' is already being probed")]
    ProbeInFlight(String),
    /// 任务不存在或已被移除
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    /// 等待超时，任务仍在继续
    #[error("timed out after {waited:?} waiting for task {task_id}")]
    Timeout { task_id: TaskId, waited: Duration },
    /// 重试次数耗尽
    #[error("task {task_id} failed after {} attempt(s): {}", .attempts.len(), format_attempts(.attempts))]
    TaskFailed { task_id: TaskId, attempts: Vec<Attempt> },
    /// 任务在开始运行前被取消
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),
    /// 任务已开始运行，无法取消
    #[error("task {task_id} is {state} and can no longer be cancelled")]
    NotCancellable { task_id: TaskId, state: String },
    /// 调度器已关闭
    #[error("scheduler is shut down")]
    ShutDown,
    /// 没有可用于划分的健康设备
    #[error("no healthy devices available")]
    NoHealthyDevices,
    /// 聚合分片更新失败
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] anyhow::Error),
}

/// 通用结果类型
pub type Result<T> = std::result::Result<T, Error>;

fn format_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(Attempt::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failed_lists_every_attempt() {
        let task_id = TaskId::new();
        let err = Error::TaskFailed {
            task_id,
            attempts: vec![
                Attempt { device: "a".into(), reason: "boom".into(), device_fault: false },
                Attempt { device: "b".into(), reason: "lost".into(), device_fault: true },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 attempt(s)"));
        assert!(msg.contains("a (remote): boom"));
        assert!(msg.contains("b (device): lost"));
    }
}
