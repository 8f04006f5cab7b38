// device.rs
// 设备实体、探测得到的能力与生命周期状态。
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DeviceDescriptor;

/// 设备在注册表中的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// 未注册
    Unregistered,
    /// 探测中
    Probing,
    /// 最近一次探测通过，之后没有分派失败
    Healthy,
    /// 最近一次探测或分派失败
    Unreachable,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Unregistered => "unregistered",
            DeviceState::Probing => "probing",
            DeviceState::Healthy => "healthy",
            DeviceState::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// 探测成功后得到的设备能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub num_accelerators: u32,
    /// 通道往返延迟，取自探测时的列举命令
    pub average_latency: Duration,
}

/// 已注册的设备
///
/// 假定同一设备上的加速器属于同一型号；混装不同型号的设备按相同型号处理。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub description: String,
    pub network_address: String,
    /// 访问 `network_address` 使用的私钥
    pub permission_key: Option<String>,
    /// 探测前为 `None`
    pub num_accelerators: Option<u32>,
    /// 探测前为 `None`
    pub average_latency: Option<Duration>,
    pub state: DeviceState,
    /// 最近一次变为 `Unreachable` 的原因
    pub last_failure: Option<String>,
}

impl Device {
    pub fn from_descriptor(descriptor: &DeviceDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            network_address: descriptor.network_address.clone(),
            permission_key: descriptor
                .permission_key
                .clone()
                .filter(|key| !key.is_empty()),
            num_accelerators: None,
            average_latency: None,
            state: DeviceState::Unregistered,
            last_failure: None,
        }
    }

    pub fn capability(&self) -> Option<DeviceCapability> {
        match (self.num_accelerators, self.average_latency) {
            (Some(num_accelerators), Some(average_latency)) => Some(DeviceCapability {
                num_accelerators,
                average_latency,
            }),
            _ => None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == DeviceState::Healthy
    }

    /// 可同时运行的任务数
    pub fn capacity(&self, tasks_per_accelerator: usize) -> usize {
        self.num_accelerators.unwrap_or(0) as usize * tasks_per_accelerator
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            network_address: self.network_address.clone(),
            capability: self.capability(),
            state: self.state,
            last_failure: self.last_failure.clone(),
        }
    }
}

/// 调度排序：延迟低的优先，其次加速器多的优先，最后按名称
pub fn rank(a: &Device, b: &Device) -> Ordering {
    let latency = |d: &Device| d.average_latency.unwrap_or(Duration::MAX);
    latency(a)
        .cmp(&latency(b))
        .then_with(|| b.num_accelerators.cmp(&a.num_accelerators))
        .then_with(|| a.name.cmp(&b.name))
}

/// 对外展示的设备信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub name: String,
    pub description: String,
    pub network_address: String,
    pub capability: Option<DeviceCapability>,
    pub state: DeviceState,
    pub last_failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, accelerators: u32, latency_ms: u64) -> Device {
        let mut d = Device::from_descriptor(&DeviceDescriptor::new(name, "", "host"));
        d.num_accelerators = Some(accelerators);
        d.average_latency = Some(Duration::from_millis(latency_ms));
        d.state = DeviceState::Healthy;
        d
    }

    #[test]
    fn ranks_by_latency_then_capacity() {
        let mut devices = vec![
            device("slow", 8, 40),
            device("small", 1, 10),
            device("big", 4, 10),
            device("also-big", 4, 10),
        ];
        devices.sort_by(rank);
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["also-big", "big", "small", "slow"]);
    }

    #[test]
    fn unprobed_device_has_no_capability() {
        let d = Device::from_descriptor(&DeviceDescriptor::new("a", "", "host"));
        assert_eq!(d.capability(), None);
        assert_eq!(d.capacity(2), 0);
        assert_eq!(d.state, DeviceState::Unregistered);
    }

    #[test]
    fn empty_permission_key_is_dropped() {
        let mut descriptor = DeviceDescriptor::new("a", "", "host");
        descriptor.permission_key = Some(String::new());
        assert_eq!(Device::from_descriptor(&descriptor).permission_key, None);
    }
}
