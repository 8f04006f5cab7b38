// lib.rs
// 调度器模块入口，声明各子模块并导出常用类型。
pub mod cluster;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod training;

#[cfg(test)]
mod testutil;

pub use cluster::{Cluster, ClusterOptions};
pub use config::{ClusterFile, DeviceDescriptor, ProbeConfig, SchedulerConfig};
pub use device::{Device, DeviceCapability, DeviceState, DeviceSummary};
pub use error::{Error, Result};
pub use executor::{RemoteExecutor, SshExecutor};
pub use registry::{DeviceRegistry, RegisterOutcome};
pub use scheduler::{ShutdownMode, TaskScheduler};
pub use task::{ChunkDescriptor, InferenceChunk, SubmitOptions, TaskId, TaskState, Work};
pub use training::{Aggregator, InferenceJob, InferenceReport, TrainingJob};
