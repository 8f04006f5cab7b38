// main.rs
// 命令行入口：读取设备配置，列出设备状态或提交单个任务并打印结果。
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prettytable::{row, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use distcuda_scheduler::{Cluster, ClusterOptions, DeviceSummary, ShutdownMode, Work};

#[derive(Debug, Parser)]
#[command(name = "distcuda", version, about = "Pool remote GPU machines and run work on them")]
struct Cli {
    /// 设备配置文件
    #[arg(long, short, global = true, env = "DISTCUDA_CONFIG", default_value = "cluster.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 探测所有设备并打印状态表
    Devices,
    /// 提交一次远程调用并等待结果
    Run {
        /// 远程入口名
        function: String,
        /// JSON 格式的参数
        #[arg(long, default_value = "null")]
        args: String,
        /// 等待结果的秒数，不填则一直等待
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn print_devices(devices: &[DeviceSummary]) {
    let mut table = Table::new();
    table.add_row(row!["名称", "描述", "地址", "加速器", "延迟(ms)", "状态", "最近失败"]);
    for d in devices {
        let (accelerators, latency) = match d.capability {
            Some(c) => (
                c.num_accelerators.to_string(),
                format!("{:.1}", c.average_latency.as_secs_f64() * 1000.0),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        table.add_row(row![
            d.name,
            d.description,
            d.network_address,
            accelerators,
            latency,
            d.state,
            d.last_failure.as_deref().unwrap_or("")
        ]);
    }
    table.printstd();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cluster = Cluster::from_file(&cli.config, ClusterOptions::default())
        .await
        .with_context(|| format!("cannot start cluster from {}", cli.config.display()))?;
    for (index, error) in cluster.rejected() {
        eprintln!("配置条目 {} 被拒绝: {}", index, error);
    }

    let outcome = match cli.command {
        Command::Devices => {
            print_devices(&cluster.available_devices().await);
            Ok(())
        }
        Command::Run {
            function,
            args,
            timeout,
        } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("--args is not valid JSON")?;
            info!(%function, "submitting");
            cluster
                .run(Work::call(function, args), timeout.map(Duration::from_secs))
                .await
                .context("task did not complete")
                .and_then(|value| {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    Ok(())
                })
        }
    };

    cluster.shutdown(ShutdownMode::Cancel).await?;
    outcome
}
