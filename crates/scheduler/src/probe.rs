// probe.rs
// 设备探测：在设备接收任务前检查连通性、加速器数量与功能，并测量延迟。
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::device::DeviceCapability;
use crate::error::{ExecError, ProbeError};
use crate::executor::{RemoteCommand, RemoteExecutor, RemoteTarget};

/// 通过 `RemoteExecutor` 探测设备
#[derive(Clone)]
pub struct DeviceProbe {
    executor: Arc<dyn RemoteExecutor>,
    config: ProbeConfig,
}

impl DeviceProbe {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: ProbeConfig) -> Self {
        Self { executor, config }
    }

    /// 统计 `target` 上的加速器，逐个做冒烟测试并测量延迟
    ///
    /// 任何一个加速器失败，整台设备都被拒绝。延迟只取列举命令的往返时间，
    /// 冒烟测试的耗时主要是远端解释器启动，不计入。
    pub async fn probe(&self, target: &RemoteTarget) -> Result<DeviceCapability, ProbeError> {
        let started = Instant::now();
        let listing = self
            .executor
            .execute(
                target,
                &RemoteCommand::new(&self.config.enumerate_command, self.config.connect_timeout),
            )
            .await
            .map_err(|e| ProbeError::Connection(e.to_string()))?;
        let latency = started.elapsed();
        if !listing.success() {
            return Err(ProbeError::Enumeration(format!(
                "exit status {}: {}",
                listing.exit_status,
                listing.stderr.trim()
            )));
        }
        let indexes = parse_accelerator_list(&listing.stdout)?;
        debug!(address = %target.address, count = indexes.len(), "accelerators listed");

        for &index in &indexes {
            self.smoke_test(target, index).await?;
        }

        let capability = DeviceCapability {
            num_accelerators: indexes.len() as u32,
            average_latency: latency,
        };
        info!(
            address = %target.address,
            accelerators = capability.num_accelerators,
            latency_ms = capability.average_latency.as_millis() as u64,
            "probe passed"
        );
        Ok(capability)
    }

    async fn smoke_test(&self, target: &RemoteTarget, index: u32) -> Result<(), ProbeError> {
        let values = smoke_test_buffer(self.config.smoke_test_len);
        let expected: f64 = values.iter().map(|&v| v as f64).sum();
        let stdin = values
            .iter()
            .map(f32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let command = RemoteCommand::new(self.config.smoke_test_for(index), self.config.command_timeout)
            .with_stdin(stdin);

        let fault = |reason: String| ProbeError::AcceleratorFault { index, reason };
        let output = match self.executor.execute(target, &command).await {
            Ok(output) => output,
            Err(ExecError::Timeout(after)) => return Err(fault(format!("no answer after {:?}", after))),
            Err(e) => return Err(ProbeError::Connection(e.to_string())),
        };
        if !output.success() {
            return Err(fault(format!(
                "exit status {}: {}",
                output.exit_status,
                output.stderr.trim()
            )));
        }
        let reported = output
            .stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| fault("no result printed".to_string()))?;
        let reported: f64 = reported
            .trim()
            .parse()
            .map_err(|_| fault(format!("result is not a number: {:?}", reported.trim())))?;
        if !reported.is_finite() || (reported - expected).abs() > 1e-3 * expected.abs().max(1.0) {
            warn!(address = %target.address, index, expected, reported, "wrong reduction result");
            return Err(fault(format!("expected {}, got {}", expected, reported)));
        }
        Ok(())
    }
}

fn smoke_test_buffer(len: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..len.max(1)).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// 解析 `nvidia-smi --list-gpus` 风格的输出，每行 `GPU <n>: ...` 对应一个加速器
pub fn parse_accelerator_list(output: &str) -> Result<Vec<u32>, ProbeError> {
    let mut indexes = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let index = line
            .strip_prefix("GPU ")
            .and_then(|rest| rest.split_once(':'))
            .and_then(|(n, _)| n.trim().parse::<u32>().ok())
            .ok_or_else(|| ProbeError::Enumeration(format!("unexpected line: {:?}", line)))?;
        indexes.push(index);
    }
    if indexes.is_empty() {
        return Err(ProbeError::Enumeration("no accelerators listed".to_string()));
    }
    Ok(indexes)
}
