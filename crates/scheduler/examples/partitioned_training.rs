// partitioned_training.rs
// 示例：按加速器数量划分数据集，在健康设备上运行多个 epoch 并打印每轮聚合结果，最后用最终快照做一次分布式推理。
//
// 运行：cargo run --example partitioned_training -- cluster.json 60000 3 64
use anyhow::{Context, Result};
use prettytable::{row, Table};
use tracing_subscriber::EnvFilter;

use distcuda_scheduler::training::{partition, WeightedAverage};
use distcuda_scheduler::{Cluster, ClusterOptions, InferenceJob, ShutdownMode, TrainingJob};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "cluster.json".to_string());
    let dataset_size: u64 = match args.next() {
        Some(n) => n.parse().context("数据集大小必须是整数")?,
        None => 60_000,
    };
    let epochs: u32 = match args.next() {
        Some(n) => n.parse().context("epoch 数必须是整数")?,
        None => 3,
    };
    let batch_size: u32 = match args.next() {
        Some(n) => n.parse().context("批大小必须是整数")?,
        None => distcuda_scheduler::task::DEFAULT_BATCH_SIZE,
    };

    let cluster = Cluster::from_file(&path, ClusterOptions::default())
        .await
        .with_context(|| format!("无法加载 {}", path))?;

    // 先展示划分方案
    let mut devices: Vec<(String, u32)> = cluster
        .registry()
        .healthy_devices()
        .await
        .into_iter()
        .map(|d| (d.name, d.num_accelerators.unwrap_or(0)))
        .collect();
    devices.sort();
    let mut table = Table::new();
    table.add_row(row!["设备", "加速器", "区间", "样本数"]);
    for p in partition(dataset_size, &devices) {
        let accelerators = devices
            .iter()
            .find(|(name, _)| *name == p.device)
            .map_or(0, |(_, n)| *n);
        table.add_row(row![
            p.device,
            accelerators,
            format!("[{}, {})", p.range.start, p.range.end),
            p.len()
        ]);
    }
    table.printstd();

    let job = TrainingJob::new("example-job", dataset_size, "snapshots/initial")
        .with_epochs(epochs)
        .with_batch_size(batch_size)
        .with_aggregator(WeightedAverage);
    let reports = job.run(cluster.scheduler()).await?;
    for report in &reports {
        println!(
            "epoch {}: 快照 {}，{} 个分片，丢弃 {} 个，聚合结果 {}",
            report.epoch,
            report.snapshot_ref,
            report.partitions.len(),
            report.lost.len(),
            report.aggregate
        );
        for (p, reason) in &report.lost {
            println!("  丢弃 {} [{}, {}): {}", p.device, p.range.start, p.range.end, reason);
        }
    }

    let snapshot = job.snapshot_for(epochs);
    println!("\n=== 用 {} 推理 ===", snapshot);
    let inference = InferenceJob::new("example-eval", dataset_size, snapshot)
        .with_batch_size(batch_size)
        .run(cluster.scheduler())
        .await?;
    println!(
        "得到 {} 个预测，丢弃 {} 个分片",
        inference.predictions.len(),
        inference.lost.len()
    );

    cluster.shutdown(ShutdownMode::Drain).await?;
    Ok(())
}
