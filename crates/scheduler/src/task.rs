// task.rs
// 任务标识、工作负载、提交选项与任务状态机。
use std::fmt;
use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务 ID，提交时生成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 远端按批处理分片时的默认批大小
pub const DEFAULT_BATCH_SIZE: u32 = 32;

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

/// 训练作业的一个分片：某个模型快照上的一段数据区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// 所属训练作业
    pub job_id: String,
    /// 所属 epoch
    pub epoch: u32,
    /// 半开区间 `[start, end)`
    pub dataset_range: Range<u64>,
    /// 远端需要加载的模型快照引用
    pub model_snapshot_ref: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

/// 推理作业的一个分片，远端对区间内每个样本返回一个预测
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceChunk {
    pub job_id: String,
    /// 半开区间 `[start, end)`
    pub dataset_range: Range<u64>,
    pub model_snapshot_ref: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

/// 远端 worker 可执行的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Work {
    /// 以 JSON 参数调用远端的具名入口
    Call {
        function: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// 计算一个训练分片的本地更新
    TrainingChunk(ChunkDescriptor),
    /// 对一个数据区间做推理
    InferenceChunk(InferenceChunk),
}

impl Work {
    pub fn call(function: impl Into<String>, args: serde_json::Value) -> Self {
        Work::Call {
            function: function.into(),
            args,
        }
    }

    /// 日志中使用的简短标签
    pub fn label(&self) -> String {
        match self {
            Work::Call { function, .. } => function.clone(),
            Work::TrainingChunk(chunk) => format!(
                "{}#{}[{}..{})",
                chunk.job_id, chunk.epoch, chunk.dataset_range.start, chunk.dataset_range.end
            ),
            Work::InferenceChunk(chunk) => format!(
                "{}[{}..{})",
                chunk.job_id, chunk.dataset_range.start, chunk.dataset_range.end
            ),
        }
    }
}

/// 提交选项
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// 覆盖按延迟推算的分派截止时间
    pub timeout: Option<Duration>,
    /// 有空闲容量时优先使用的设备
    pub preferred_device: Option<String>,
}

impl SubmitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn prefer(mut self, device: impl Into<String>) -> Self {
        self.preferred_device = Some(device.into());
        self
    }
}

/// 任务状态
///
/// `Pending -> Assigned -> Running -> Completed | Failed`。失败的尝试回到
/// `Pending` 并插到队首，直到重试次数耗尽。`Pending` 与 `Assigned` 可以转为 `Cancelled`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// 等待设备
    Pending,
    /// 已分配设备，尚未开始
    Assigned(String),
    /// 正在设备上执行
    Running(String),
    /// 执行完成
    Completed(serde_json::Value),
    /// 重试耗尽
    Failed,
    /// 运行前被取消
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed(_) | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Assigned(_) => "assigned",
            TaskState::Running(_) => "running",
            TaskState::Completed(_) => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}
