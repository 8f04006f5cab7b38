// registry.rs
// 设备注册表：维护所有设备及其生命周期状态。
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::DeviceDescriptor;
use crate::device::{rank, Device, DeviceCapability, DeviceState, DeviceSummary};
use crate::error::{Error, ProbeError, Result};
use crate::executor::RemoteTarget;
use crate::probe::DeviceProbe;

/// 注册或重新探测的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Healthy(DeviceCapability),
    Unreachable(ProbeError),
}

impl RegisterOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, RegisterOutcome::Healthy(_))
    }
}

/// 按名称索引的设备表，支持并发访问
///
/// 每次状态变化都在一次写锁内完成，读者不会看到中间状态；探测在锁外进行。
#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Device>>>,
    probe: DeviceProbe,
}

impl DeviceRegistry {
    pub fn new(probe: DeviceProbe) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            probe,
        }
    }

    /// 添加设备并探测；探测失败通过返回值报告而不是错误
    pub async fn register(&self, descriptor: DeviceDescriptor) -> Result<RegisterOutcome> {
        let mut device = Device::from_descriptor(&descriptor);
        device.state = DeviceState::Probing;
        let target = RemoteTarget::from(&device);
        {
            let mut devices = self.devices.write().await;
            if devices.contains_key(&device.name) {
                return Err(Error::DuplicateDevice(device.name));
            }
            info!(device = %device.name, address = %device.network_address, "registering device");
            devices.insert(device.name.clone(), device.clone());
        }
        self.finish_probe(&device.name, &target).await
    }

    /// 并发注册多台设备，结果顺序与输入一致
    pub async fn register_all(
        &self,
        descriptors: Vec<DeviceDescriptor>,
    ) -> Vec<(String, Result<RegisterOutcome>)> {
        let handles: Vec<_> = descriptors
            .into_iter()
            .map(|descriptor| {
                let registry = self.clone();
                let name = descriptor.name.clone();
                (name, tokio::spawn(async move { registry.register(descriptor).await }))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(Error::ShutDown),
            };
            outcomes.push((name, outcome));
        }
        outcomes
    }

    /// 重新探测已注册的设备，例如让不可达的设备恢复
    pub async fn reprobe(&self, name: &str) -> Result<RegisterOutcome> {
        let target = {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(name)
                .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;
            if device.state == DeviceState::Probing {
                return Err(Error::ProbeInFlight(name.to_string()));
            }
            device.state = DeviceState::Probing;
            RemoteTarget::from(&*device)
        };
        debug!(device = %name, "re-probing");
        self.finish_probe(name, &target).await
    }

    async fn finish_probe(&self, name: &str, target: &RemoteTarget) -> Result<RegisterOutcome> {
        let verdict = self.probe.probe(target).await;

        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(name)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;
        match verdict {
            Ok(capability) => {
                device.num_accelerators = Some(capability.num_accelerators);
                device.average_latency = Some(capability.average_latency);
                device.state = DeviceState::Healthy;
                device.last_failure = None;
                info!(device = %name, accelerators = capability.num_accelerators, "device healthy");
                Ok(RegisterOutcome::Healthy(capability))
            }
            Err(e) => {
                device.state = DeviceState::Unreachable;
                device.last_failure = Some(e.to_string());
                warn!(device = %name, error = %e, "device failed probe");
                Ok(RegisterOutcome::Unreachable(e))
            }
        }
    }

    /// 把设备移出调度；重复调用不产生变化
    ///
    /// 正在探测的设备保持 `Probing`，由探测结果决定其状态。
    pub async fn mark_unreachable(&self, name: &str, reason: &str) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(name)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;
        match device.state {
            DeviceState::Unreachable => return Ok(()),
            DeviceState::Probing => {
                debug!(device = %name, reason, "probe in flight, leaving state to the probe");
                return Ok(());
            }
            _ => {}
        }
        device.state = DeviceState::Unreachable;
        device.last_failure = Some(reason.to_string());
        warn!(device = %name, reason, "device marked unreachable");
        Ok(())
    }

    /// 健康设备，按调度优先级排序
    pub async fn healthy_devices(&self) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut healthy: Vec<Device> = devices.values().filter(|d| d.is_healthy()).cloned().collect();
        healthy.sort_by(rank);
        healthy
    }

    /// 所有已注册设备，按名称排序
    pub async fn available_devices(&self) -> Vec<DeviceSummary> {
        let devices = self.devices.read().await;
        let mut summaries: Vec<DeviceSummary> = devices.values().map(Device::summary).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn get(&self, name: &str) -> Option<Device> {
        self.devices.read().await.get(name).cloned()
    }

    pub async fn state(&self, name: &str) -> DeviceState {
        self.devices
            .read()
            .await
            .get(name)
            .map_or(DeviceState::Unregistered, |d| d.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::testutil::{FakeCluster, HostScript};
    use std::time::Duration;

    fn registry(cluster: &Arc<FakeCluster>) -> DeviceRegistry {
        DeviceRegistry::new(DeviceProbe::new(cluster.clone(), ProbeConfig::default()))
    }

    fn descriptor(name: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(name, "fake", name)
    }

    #[tokio::test]
    async fn registration_reports_probe_verdict() {
        let cluster = FakeCluster::new();
        cluster.add_host("good", HostScript::healthy(2));
        cluster.add_host("bad", HostScript::healthy(2).faulty_accelerator(1));
        let registry = registry(&cluster);

        let outcome = registry.register(descriptor("good")).await.unwrap();
        assert!(matches!(outcome, RegisterOutcome::Healthy(c) if c.num_accelerators == 2));

        let outcome = registry.register(descriptor("bad")).await.unwrap();
        assert!(matches!(
            outcome,
            RegisterOutcome::Unreachable(ProbeError::AcceleratorFault { index: 1, .. })
        ));
        assert_eq!(registry.state("bad").await, DeviceState::Unreachable);
        assert!(registry.get("bad").await.unwrap().last_failure.is_some());
        assert_eq!(registry.state("never").await, DeviceState::Unregistered);

        let healthy: Vec<_> = registry.healthy_devices().await.into_iter().map(|d| d.name).collect();
        assert_eq!(healthy, vec!["good"]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let cluster = FakeCluster::new();
        cluster.add_host("a", HostScript::healthy(1));
        let registry = registry(&cluster);
        registry.register(descriptor("a")).await.unwrap();
        let err = registry.register(descriptor("a")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateDevice(ref n) if n == "a"));
    }

    #[tokio::test]
    async fn mark_unreachable_is_idempotent() {
        let cluster = FakeCluster::new();
        cluster.add_host("a", HostScript::healthy(1));
        let registry = registry(&cluster);
        registry.register(descriptor("a")).await.unwrap();

        registry.mark_unreachable("a", "first").await.unwrap();
        let once = registry.get("a").await.unwrap();
        registry.mark_unreachable("a", "first").await.unwrap();
        let twice = registry.get("a").await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.state, DeviceState::Unreachable);
        // 保留历史能力信息
        assert_eq!(twice.num_accelerators, Some(1));
        assert!(registry.healthy_devices().await.is_empty());

        assert!(matches!(
            registry.mark_unreachable("ghost", "x").await,
            Err(Error::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn reprobe_brings_device_back() {
        let cluster = FakeCluster::new();
        cluster.add_host("a", HostScript::healthy(1).unreachable());
        let registry = registry(&cluster);
        let outcome = registry.register(descriptor("a")).await.unwrap();
        assert!(matches!(outcome, RegisterOutcome::Unreachable(ProbeError::Connection(_))));

        cluster.update("a", |s| s.reachable = true);
        assert!(registry.reprobe("a").await.unwrap().is_healthy());
        assert_eq!(registry.state("a").await, DeviceState::Healthy);
        assert_eq!(registry.get("a").await.unwrap().last_failure, None);

        assert!(matches!(registry.reprobe("ghost").await, Err(Error::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn probing_devices_are_not_listed_as_healthy() {
        let cluster = FakeCluster::new();
        cluster.add_host("slow", HostScript::healthy(1).probe_delay(Duration::from_millis(100)));
        let registry = registry(&cluster);

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.register(descriptor("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.state("slow").await, DeviceState::Probing);
        assert!(registry.healthy_devices().await.is_empty());
        assert!(matches!(registry.reprobe("slow").await, Err(Error::ProbeInFlight(_))));

        assert!(pending.await.unwrap().unwrap().is_healthy());
        assert_eq!(registry.healthy_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_failure_during_registration_keeps_device_probing() {
        let cluster = FakeCluster::new();
        cluster.add_host("slow", HostScript::healthy(1).probe_delay(Duration::from_millis(100)));
        let registry = registry(&cluster);

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.register(descriptor("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.mark_unreachable("slow", "channel closed").await.unwrap();
        assert_eq!(registry.state("slow").await, DeviceState::Probing);
        assert!(matches!(registry.reprobe("slow").await, Err(Error::ProbeInFlight(_))));

        assert!(pending.await.unwrap().unwrap().is_healthy());
        assert_eq!(registry.state("slow").await, DeviceState::Healthy);
        // 一次列举加一次冒烟测试，没有第二次探测
        assert_eq!(cluster.calls("slow"), 2);
    }

    #[tokio::test]
    async fn register_all_keeps_input_order() {
        let cluster = FakeCluster::new();
        cluster.add_host("a", HostScript::healthy(1));
        cluster.add_host("b", HostScript::healthy(4));
        cluster.add_host("c", HostScript::healthy(2).unreachable());
        let registry = registry(&cluster);

        let outcomes = registry
            .register_all(vec![descriptor("a"), descriptor("b"), descriptor("c"), descriptor("a")])
            .await;
        let names: Vec<_> = outcomes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "a"]);
        assert!(outcomes[1].1.as_ref().unwrap().is_healthy());
        assert!(!outcomes[2].1.as_ref().unwrap().is_healthy());
        // 两次 "a" 注册只有一次成功
        let duplicates = outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Err(Error::DuplicateDevice(_))))
            .count();
        assert_eq!(duplicates, 1);

        let summaries = registry.available_devices().await;
        let states: Vec<_> = summaries.iter().map(|s| (s.name.as_str(), s.state)).collect();
        assert_eq!(
            states,
            vec![
                ("a", DeviceState::Healthy),
                ("b", DeviceState::Healthy),
                ("c", DeviceState::Unreachable)
            ]
        );
    }
}
