// register_and_submit.rs
// 示例：从配置文件注册设备，打印探测结果，再提交一批远程调用并收集结果。
//
// 运行：cargo run --example register_and_submit -- cluster.json
use std::time::Duration;

use anyhow::{Context, Result};
use prettytable::{row, Table};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use distcuda_scheduler::{Cluster, ClusterOptions, RegisterOutcome, ShutdownMode, Work};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "cluster.json".to_string());
    println!("=== 注册设备: {} ===", path);
    let cluster = Cluster::from_file(&path, ClusterOptions::default())
        .await
        .with_context(|| format!("无法加载 {}", path))?;

    let mut table = Table::new();
    table.add_row(row!["设备", "结果"]);
    for (name, outcome) in cluster.registrations() {
        let verdict = match outcome {
            Ok(RegisterOutcome::Healthy(c)) => format!(
                "健康，{} 个加速器，平均延迟 {:?}",
                c.num_accelerators, c.average_latency
            ),
            Ok(RegisterOutcome::Unreachable(e)) => format!("不可用: {}", e),
            Err(e) => format!("拒绝: {}", e),
        };
        table.add_row(row![name, verdict]);
    }
    for (index, error) in cluster.rejected() {
        table.add_row(row![format!("条目 #{}", index), format!("配置错误: {}", error)]);
    }
    table.printstd();

    let healthy = cluster.registry().healthy_devices().await;
    if healthy.is_empty() {
        println!("没有健康设备，退出");
        return Ok(());
    }

    println!("\n=== 提交 10 个求和任务 ===");
    let mut tasks = Vec::new();
    for i in 0..10 {
        let id = cluster.submit(Work::call("add", json!([i, i * 10]))).await?;
        tasks.push((i, id));
    }
    for (i, id) in tasks {
        match cluster.wait_for_result(id, Some(Duration::from_secs(120))).await {
            Ok(value) => println!("任务 {} ({}) -> {}", i, id, value),
            Err(e) => println!("任务 {} ({}) 失败: {}", i, id, e),
        }
    }

    cluster.shutdown(ShutdownMode::Drain).await?;
    Ok(())
}
