// cluster.rs
// 集群句柄：把配置加载、设备注册和调度器组装在一起，对外提供提交与查询接口。
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::{ClusterFile, DeviceDescriptor, ProbeConfig, SchedulerConfig};
use crate::device::DeviceSummary;
use crate::error::{Error, Result};
use crate::executor::{RemoteExecutor, SshExecutor};
use crate::probe::DeviceProbe;
use crate::registry::{DeviceRegistry, RegisterOutcome};
use crate::scheduler::{ShutdownMode, TaskScheduler};
use crate::task::{SubmitOptions, TaskId, Work};

/// 组装集群所需的全部配置
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    pub scheduler: SchedulerConfig,
    pub probe: ProbeConfig,
}

/// 一个设备池及其调度器
///
/// 由显式构造函数创建，用完后调用 `shutdown`。
pub struct Cluster {
    scheduler: TaskScheduler,
    registrations: Vec<(String, Result<RegisterOutcome>)>,
    /// 配置文件中被拒绝的条目 `(序号, ConfigParse 错误)`
    rejected: Vec<(usize, Error)>,
}

impl Cluster {
    /// 并发注册所有设备并启动调度器
    pub async fn start(
        descriptors: Vec<DeviceDescriptor>,
        executor: Arc<dyn RemoteExecutor>,
        options: ClusterOptions,
    ) -> Self {
        let registry = DeviceRegistry::new(DeviceProbe::new(executor.clone(), options.probe));
        let registrations = registry.register_all(descriptors).await;

        let healthy = registrations
            .iter()
            .filter(|(_, r)| matches!(r, Ok(outcome) if outcome.is_healthy()))
            .count();
        for (name, outcome) in &registrations {
            if let Err(e) = outcome {
                warn!(device = %name, error = %e, "registration rejected");
            }
        }
        info!(total = registrations.len(), healthy, "cluster started");

        let scheduler = TaskScheduler::new(registry, executor, options.scheduler);
        Self {
            scheduler,
            registrations,
            rejected: Vec::new(),
        }
    }

    /// 用已解析的配置文件启动，被拒绝的条目通过 `rejected` 返回给调用方
    pub async fn from_cluster_file(
        file: ClusterFile,
        executor: Arc<dyn RemoteExecutor>,
        options: ClusterOptions,
    ) -> Self {
        let ClusterFile { devices, rejected } = file;
        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "cluster file has rejected entries");
        }
        let mut cluster = Self::start(devices, executor, options).await;
        cluster.rejected = rejected;
        cluster
    }

    /// 从设备配置文件启动，通过系统 `ssh` 访问设备
    pub async fn from_file(path: impl AsRef<Path>, options: ClusterOptions) -> Result<Self> {
        let file = ClusterFile::load(path)?;
        let executor = Arc::new(SshExecutor::new(options.probe.connect_timeout));
        Ok(Self::from_cluster_file(file, executor, options).await)
    }

    /// 每台设备的注册结果，顺序与输入一致
    pub fn registrations(&self) -> &[(String, Result<RegisterOutcome>)] {
        &self.registrations
    }

    /// 配置文件中未通过解析或校验的条目，按文件中的序号排列
    pub fn rejected(&self) -> &[(usize, Error)] {
        &self.rejected
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &DeviceRegistry {
        self.scheduler.registry()
    }

    pub async fn available_devices(&self) -> Vec<DeviceSummary> {
        self.registry().available_devices().await
    }

    pub async fn submit(&self, work: Work) -> Result<TaskId> {
        self.scheduler.submit(work).await
    }

    pub async fn submit_with(&self, work: Work, options: SubmitOptions) -> Result<TaskId> {
        self.scheduler.submit_with(work, options).await
    }

    pub async fn wait_for_result(&self, task_id: TaskId, timeout: Option<Duration>) -> Result<Value> {
        self.scheduler.wait_for_result(task_id, timeout).await
    }

    /// 提交并等待结果
    pub async fn run(&self, work: Work, timeout: Option<Duration>) -> Result<Value> {
        let task_id = self.submit(work).await?;
        self.wait_for_result(task_id, timeout).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.scheduler.cancel(task_id).await
    }

    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        self.scheduler.shutdown(mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use crate::testutil::{FakeCluster, HostScript};
    use serde_json::json;

    #[tokio::test]
    async fn starts_with_probe_passing_subset() {
        let fake = FakeCluster::new();
        fake.add_host("10.0.0.1", HostScript::healthy(2));
        fake.add_host("10.0.0.2", HostScript::healthy(1).wrong_sums());
        let descriptors = vec![
            DeviceDescriptor::new("alpha", "RTX 3080", "10.0.0.1"),
            DeviceDescriptor::new("beta", "Tesla V100", "10.0.0.2"),
            DeviceDescriptor::new("alpha", "RTX 3080", "10.0.0.1"),
        ];
        let cluster = Cluster::start(descriptors, fake, ClusterOptions::default()).await;

        let duplicates = cluster
            .registrations()
            .iter()
            .filter(|(_, r)| matches!(r, Err(Error::DuplicateDevice(_))))
            .count();
        assert_eq!(duplicates, 1);
        let states: Vec<_> = cluster
            .available_devices()
            .await
            .into_iter()
            .map(|d| (d.name, d.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("alpha".to_string(), DeviceState::Healthy),
                ("beta".to_string(), DeviceState::Unreachable),
            ]
        );

        let value = cluster
            .run(Work::call("add", json!([1.5, 2.5])), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(value, json!(4.0));

        cluster.shutdown(ShutdownMode::Drain).await.unwrap();
        assert!(matches!(cluster.submit(Work::call("add", json!([]))).await, Err(Error::ShutDown)));
    }

    #[tokio::test]
    async fn rejected_entries_reach_the_caller() {
        let fake = FakeCluster::new();
        fake.add_host("10.0.0.1", HostScript::healthy(1));
        let file = ClusterFile::parse(
            r#"{"devices": [
                {"name": "bad"},
                {"name": "alpha", "network_address": "10.0.0.1"}
            ]}"#,
        )
        .unwrap();
        let cluster = Cluster::from_cluster_file(file, fake, ClusterOptions::default()).await;

        assert_eq!(cluster.registrations().len(), 1);
        assert!(cluster.registrations()[0].1.as_ref().unwrap().is_healthy());
        assert_eq!(cluster.rejected().len(), 1);
        assert!(matches!(cluster.rejected()[0], (0, Error::ConfigParse(_))));
        cluster.shutdown(ShutdownMode::Cancel).await.unwrap();
    }

    #[tokio::test]
    async fn missing_config_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Cluster::from_file(dir.path().join("cluster.json"), ClusterOptions::default()).await;
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }
}
