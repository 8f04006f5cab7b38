// testutil.rs
// 测试用的内存集群：`FakeCluster` 按每台主机的 `HostScript` 在本地应答探测命令与任务信封，测试可在运行中修改脚本。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ExecError;
use crate::executor::{ExecOutput, RemoteCommand, RemoteExecutor, RemoteTarget};
use crate::task::Work;

/// 一台模拟主机的行为
#[derive(Debug, Clone)]
pub struct HostScript {
    pub accelerators: u32,
    pub reachable: bool,
    pub faulty_accelerator: Option<u32>,
    pub wrong_sums: bool,
    /// 所有任务都返回远端错误
    pub fail_tasks: bool,
    /// 下一次分派时断开通道，主机随后不可达
    pub drop_next_dispatch: bool,
    pub task_delay: Duration,
    pub probe_delay: Duration,
    /// 仅作用于冒烟测试命令
    pub smoke_test_delay: Duration,
}

impl HostScript {
    pub fn healthy(accelerators: u32) -> Self {
        Self {
            accelerators,
            reachable: true,
            faulty_accelerator: None,
            wrong_sums: false,
            fail_tasks: false,
            drop_next_dispatch: false,
            task_delay: Duration::ZERO,
            probe_delay: Duration::ZERO,
            smoke_test_delay: Duration::ZERO,
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn faulty_accelerator(mut self, index: u32) -> Self {
        self.faulty_accelerator = Some(index);
        self
    }

    pub fn wrong_sums(mut self) -> Self {
        self.wrong_sums = true;
        self
    }

    pub fn failing_tasks(mut self) -> Self {
        self.fail_tasks = true;
        self
    }

    pub fn task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = delay;
        self
    }

    pub fn probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn smoke_test_delay(mut self, delay: Duration) -> Self {
        self.smoke_test_delay = delay;
        self
    }
}

#[derive(Debug)]
struct Host {
    script: HostScript,
    calls: usize,
    completed: usize,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Debug, Default)]
pub struct FakeCluster {
    hosts: Mutex<HashMap<String, Host>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_host(&self, address: &str, script: HostScript) {
        self.hosts.lock().unwrap().insert(
            address.to_string(),
            Host {
                script,
                calls: 0,
                completed: 0,
                in_flight: 0,
                max_in_flight: 0,
            },
        );
    }

    pub fn update(&self, address: &str, f: impl FnOnce(&mut HostScript)) {
        let mut hosts = self.hosts.lock().unwrap();
        f(&mut hosts.get_mut(address).expect("unknown fake host").script);
    }

    /// 对该主机的所有调用次数，包括探测
    pub fn calls(&self, address: &str) -> usize {
        self.hosts.lock().unwrap().get(address).map_or(0, |h| h.calls)
    }

    /// 成功完成的任务数
    pub fn completed(&self, address: &str) -> usize {
        self.hosts.lock().unwrap().get(address).map_or(0, |h| h.completed)
    }

    /// 同时运行任务数的峰值
    pub fn max_in_flight(&self, address: &str) -> usize {
        self.hosts.lock().unwrap().get(address).map_or(0, |h| h.max_in_flight)
    }

    fn begin(&self, address: &str) -> Result<HostScript, ExecError> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(address)
            .ok_or_else(|| ExecError::Connect(format!("{}: no route to host", address)))?;
        host.calls += 1;
        if !host.script.reachable {
            return Err(ExecError::Connect(format!("{}: connection refused", address)));
        }
        Ok(host.script.clone())
    }

    async fn dispatch(
        &self,
        address: &str,
        script: HostScript,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, ExecError> {
        if script.drop_next_dispatch {
            self.update(address, |s| {
                s.drop_next_dispatch = false;
                s.reachable = false;
            });
            return Err(ExecError::Dropped("connection reset by peer".to_string()));
        }

        {
            let mut hosts = self.hosts.lock().unwrap();
            let host = hosts.get_mut(address).expect("unknown fake host");
            host.in_flight += 1;
            host.max_in_flight = host.max_in_flight.max(host.in_flight);
        }
        let reply = self.run_envelope(script, command).await;
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts.get_mut(address).expect("unknown fake host");
        host.in_flight -= 1;
        if reply.get("ok").is_some() {
            host.completed += 1;
        }
        Ok(ok_output(reply.to_string()))
    }

    async fn run_envelope(&self, script: HostScript, command: &RemoteCommand) -> Value {
        if !script.task_delay.is_zero() {
            tokio::time::sleep(script.task_delay).await;
        }
        let envelope: Value = match serde_json::from_slice(command.stdin.as_deref().unwrap_or_default()) {
            Ok(v) => v,
            Err(e) => return json!({ "error": format!("bad envelope: {}", e) }),
        };
        let work: Work = match serde_json::from_value(envelope["work"].clone()) {
            Ok(w) => w,
            Err(e) => return json!({ "error": format!("bad work: {}", e) }),
        };
        if let Work::Call { function, args } = &work {
            if function == "sleep" {
                let ms = args.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        if script.fail_tasks {
            return json!({ "error": "CUDA error: out of memory" });
        }
        match run_locally(&work) {
            Ok(value) => json!({ "ok": value }),
            Err(message) => json!({ "error": message }),
        }
    }
}

/// 模拟 worker 对工作单元的计算结果
pub fn run_locally(work: &Work) -> Result<Value, String> {
    match work {
        Work::Call { function, args } => match function.as_str() {
            "add" => {
                let sum: f64 = args
                    .as_array()
                    .ok_or("add expects an array")?
                    .iter()
                    .filter_map(Value::as_f64)
                    .sum();
                Ok(json!(sum))
            }
            "echo" => Ok(args.clone()),
            "sleep" => Ok(Value::Null),
            "fail" => Err("requested failure".to_string()),
            other => Err(format!("unknown function '{}'", other)),
        },
        Work::TrainingChunk(chunk) => {
            let samples = chunk.dataset_range.end - chunk.dataset_range.start;
            Ok(json!([1.0, samples as f64, chunk.batch_size as f64]))
        }
        // 每个样本的预测就是它的序号
        Work::InferenceChunk(chunk) => Ok(Value::from(
            chunk.dataset_range.clone().map(|i| i as f64).collect::<Vec<_>>(),
        )),
    }
}

fn ok_output(stdout: String) -> ExecOutput {
    ExecOutput {
        stdout,
        stderr: String::new(),
        exit_status: 0,
    }
}

fn answer_probe(script: &HostScript, command: &RemoteCommand) -> ExecOutput {
    if command.command.contains("--list-gpus") {
        let listing = (0..script.accelerators)
            .map(|i| format!("GPU {}: Fake Accelerator (UUID: GPU-{})\n", i, i))
            .collect::<String>();
        return ok_output(listing);
    }

    let index = command
        .command
        .split("cuda:")
        .nth(1)
        .and_then(|rest| {
            rest.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse::<u32>()
                .ok()
        })
        .unwrap_or(u32::MAX);
    if script.faulty_accelerator == Some(index) {
        return ExecOutput {
            stdout: String::new(),
            stderr: "RuntimeError: CUDA error: an illegal memory access was encountered".to_string(),
            exit_status: 1,
        };
    }
    let input = String::from_utf8_lossy(command.stdin.as_deref().unwrap_or_default()).into_owned();
    let mut sum: f64 = input
        .split_whitespace()
        .filter_map(|t| t.parse::<f64>().ok())
        .sum();
    if script.wrong_sums {
        sum += 42.0;
    }
    ok_output(format!("{}\n", sum))
}

#[async_trait]
impl RemoteExecutor for FakeCluster {
    async fn execute(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, ExecError> {
        let script = self.begin(&target.address)?;
        if command.command.contains("--list-gpus") || command.command.contains("cuda:") {
            if !script.probe_delay.is_zero() {
                tokio::time::sleep(script.probe_delay).await;
            }
            if command.command.contains("cuda:") && !script.smoke_test_delay.is_zero() {
                tokio::time::sleep(script.smoke_test_delay).await;
            }
            return Ok(answer_probe(&script, command));
        }
        let dispatch = self.dispatch(&target.address, script, command);
        tokio::time::timeout(command.timeout, dispatch)
            .await
            .map_err(|_| ExecError::Timeout(command.timeout))?
    }
}
