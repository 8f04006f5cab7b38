// config.rs
// 配置：从集群文件读取设备描述，以及调度器、探测器的参数与默认值。
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// 访问设备的方式，目前只有 SSH
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Ssh,
}

/// 集群文件中的一条设备描述
///
/// `id` / `model` / `networkAddress` 别名用于兼容旧的 `gpus` 格式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceDescriptor {
    #[serde(alias = "id")]
    pub name: String,
    #[serde(default, alias = "model")]
    pub description: String,
    #[serde(alias = "networkAddress")]
    pub network_address: String,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// 认证用的私钥路径
    #[serde(default)]
    pub permission_key: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        network_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            network_address: network_address.into(),
            connection_type: ConnectionType::Ssh,
            permission_key: None,
        }
    }

    fn validate(self) -> Result<Self> {
        if self.name.trim().is_empty() {
            return Err(Error::ConfigParse("device name is empty".to_string()));
        }
        if self.network_address.trim().is_empty() {
            return Err(Error::ConfigParse(format!(
                "device '{}' has an empty network_address",
                self.name
            )));
        }
        Ok(self)
    }
}

/// 原始文件结构，条目保持未解析，单个坏条目不影响整个文件
#[derive(Debug, Deserialize)]
struct ClusterFileJson {
    #[serde(alias = "gpus")]
    devices: Vec<serde_json::Value>,
}

/// 集群文件加载结果
#[derive(Debug, Default)]
pub struct ClusterFile {
    /// 解析成功的条目
    pub devices: Vec<DeviceDescriptor>,
    /// 被拒绝的条目 `(序号, 错误)`
    pub rejected: Vec<(usize, Error)>,
}

impl ClusterFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::ConfigParse(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let raw: ClusterFileJson = serde_json::from_str(contents)
            .map_err(|e| Error::ConfigParse(format!("invalid cluster file: {}", e)))?;

        let mut file = ClusterFile::default();
        for (index, entry) in raw.devices.into_iter().enumerate() {
            let parsed = serde_json::from_value::<DeviceDescriptor>(entry)
                .map_err(|e| Error::ConfigParse(format!("device entry {}: {}", index, e)))
                .and_then(DeviceDescriptor::validate);
            match parsed {
                Ok(descriptor) => file.devices.push(descriptor),
                Err(e) => {
                    warn!(index, error = %e, "skipping device entry");
                    file.rejected.push((index, e));
                }
            }
        }
        Ok(file)
    }
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 失败尝试达到该次数后任务最终失败
    pub max_retries: u32,
    /// 每个加速器允许的并发任务数
    pub tasks_per_accelerator: usize,
    /// 未被取走的终态结果保留时长
    #[serde(with = "duration_ms")]
    pub result_ttl: Duration,
    /// 分派截止时间的下限
    #[serde(with = "duration_ms")]
    pub min_dispatch_timeout: Duration,
    /// 截止时间 = 设备平均延迟 × 该系数，不低于 `min_dispatch_timeout`
    pub latency_timeout_factor: u32,
    /// 分配循环的唤醒周期
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// 远端 worker 命令，从 stdin 读取任务、在 stdout 输出结果
    pub worker_command: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            tasks_per_accelerator: 1,
            result_ttl: Duration::from_secs(600),
            min_dispatch_timeout: Duration::from_secs(30),
            latency_timeout_factor: 1000,
            tick_interval: Duration::from_millis(250),
            worker_command: "distcuda-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// 按设备平均延迟计算一次分派的截止时间
    pub fn dispatch_timeout(&self, average_latency: Option<Duration>) -> Duration {
        match average_latency {
            Some(latency) => latency
                .saturating_mul(self.latency_timeout_factor)
                .max(self.min_dispatch_timeout),
            None => self.min_dispatch_timeout,
        }
    }
}

/// 探测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// 首次调用（建立连接）的超时
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// 后续每次调用的超时
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
    /// 每行列出一个加速器
    pub enumerate_command: String,
    /// 在 `cuda:{index}` 上对 stdin 中的浮点数求和并打印
    pub smoke_test_command: String,
    /// 冒烟测试缓冲区长度
    pub smoke_test_len: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            enumerate_command: "nvidia-smi --list-gpus".to_string(),
            smoke_test_command: "python3 -c \"import sys, torch; \
                v = [float(t) for t in sys.stdin.read().split()]; \
                x = torch.tensor(v, device='cuda:{index}'); \
                print(x.sum().item())\""
                .to_string(),
            smoke_test_len: 100,
        }
    }
}

impl ProbeConfig {
    pub fn smoke_test_for(&self, index: u32) -> String {
        self.smoke_test_command.replace("{index}", &index.to_string())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
