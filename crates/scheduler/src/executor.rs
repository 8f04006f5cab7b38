// executor.rs
// 远程执行接口及基于系统 ssh 客户端的实现。
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::DeviceDescriptor;
use crate::device::Device;
use crate::error::ExecError;

/// 执行命令的目标地址与凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub address: String,
    pub permission_key: Option<String>,
}

impl From<&Device> for RemoteTarget {
    fn from(device: &Device) -> Self {
        Self {
            address: device.network_address.clone(),
            permission_key: device.permission_key.clone(),
        }
    }
}

impl From<&DeviceDescriptor> for RemoteTarget {
    fn from(descriptor: &DeviceDescriptor) -> Self {
        Self::from(&Device::from_descriptor(descriptor))
    }
}

/// 远程命令及可选的 stdin 数据
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
    /// 整个调用（含建立连接）的截止时间
    pub timeout: Duration,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// 命令执行后的输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// 在远程主机上执行命令
///
/// 实现必须在 `command.timeout` 内返回，并在任何路径上释放通道，包括返回的 future 被丢弃时。
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, ExecError>;
}

/// OpenSSH 无法建立会话时的退出码
const SSH_CONNECT_FAILURE: i32 = 255;

/// 调用系统 `ssh` 客户端，每次调用一个进程
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    leading_args: Vec<String>,
    connect_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            program: "ssh".to_string(),
            leading_args: Vec::new(),
            connect_timeout,
        }
    }

    /// 用 `program leading_args... <ssh 参数>` 代替 `ssh`，例如 `sshpass -e ssh`
    pub fn with_program(mut self, program: impl Into<String>, leading_args: Vec<String>) -> Self {
        self.program = program.into();
        self.leading_args = leading_args;
        self
    }

    /// 传给程序的参数列表
    pub fn build_args(&self, target: &RemoteTarget, command: &str) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]);
        if let Some(ref key) = target.permission_key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(target.address.clone());
        // 作为单个参数传递，由远端 shell 处理管道和引号
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, ExecError> {
        let mut child = Command::new(&self.program)
            .args(self.build_args(target, &command.command))
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Connect(format!("cannot start {}: {}", self.program, e)))?;

        let stdin_pipe = child.stdin.take();
        let payload = command.stdin.as_deref().unwrap_or_default();
        let run = async move {
            let feed = async move {
                if let Some(mut pipe) = stdin_pipe {
                    pipe.write_all(payload).await?;
                    pipe.shutdown().await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            if let Err(e) = fed {
                // 是否有影响由下面的退出码决定
                debug!(address = %target.address, error = %e, "stdin closed early");
            }
            output
        };

        // 超时时丢弃 `run`，子进程随之被杀掉
        let output = tokio::time::timeout(command.timeout, run)
            .await
            .map_err(|_| ExecError::Timeout(command.timeout))?
            .map_err(|e| ExecError::Dropped(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(SSH_CONNECT_FAILURE) => Err(ExecError::Connect(stderr.trim().to_string())),
            Some(exit_status) => Ok(ExecOutput {
                stdout,
                stderr,
                exit_status,
            }),
            None => Err(ExecError::Dropped(format!(
                "terminated by signal: {}",
                stderr.trim()
            ))),
        }
    }
}
