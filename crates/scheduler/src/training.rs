// training.rs
// 分布式训练与推理作业：按加速器数量划分数据集，把分片作为任务下发；训练用可替换的聚合策略合并更新，推理按区间顺序拼接预测。
use std::ops::Range;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::scheduler::TaskScheduler;
use crate::task::{ChunkDescriptor, InferenceChunk, SubmitOptions, TaskId, Work, DEFAULT_BATCH_SIZE};

/// 未指定时训练的 epoch 数
pub const DEFAULT_EPOCHS: u32 = 10;

/// 分配给一台设备的数据区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub device: String,
    /// 半开区间 `[start, end)`
    pub range: Range<u64>,
}

impl Partition {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 按权重（加速器数量）把 `[0, dataset_size)` 切成连续、互不重叠的区间
///
/// 采用最大余数法：先取理想份额的整数部分，剩余样本按小数部分从大到小逐个补齐，
/// 因此每个区间与理想份额相差不超过一个样本。权重全为 0 时按平均划分。
/// 区间为空的设备不出现在结果中。
pub fn partition(dataset_size: u64, devices: &[(String, u32)]) -> Vec<Partition> {
    if devices.is_empty() {
        return Vec::new();
    }
    let mut weights: Vec<u128> = devices.iter().map(|(_, w)| *w as u128).collect();
    if weights.iter().all(|&w| w == 0) {
        weights.iter_mut().for_each(|w| *w = 1);
    }
    let total_weight: u128 = weights.iter().sum();

    let n = dataset_size as u128;
    let mut sizes: Vec<u128> = Vec::with_capacity(devices.len());
    let mut remainders: Vec<(u128, usize)> = Vec::with_capacity(devices.len());
    for (i, w) in weights.iter().enumerate() {
        let share = n * w;
        sizes.push(share / total_weight);
        remainders.push((share % total_weight, i));
    }

    let assigned: u128 = sizes.iter().sum();
    let mut leftover = (n - assigned) as usize;
    // 余数大的优先，同余数按输入顺序
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for &(_, i) in &remainders {
        if leftover == 0 {
            break;
        }
        sizes[i] += 1;
        leftover -= 1;
    }

    let mut offset = 0u64;
    devices
        .iter()
        .zip(sizes)
        .filter_map(|((device, _), size)| {
            let size = size as u64;
            let start = offset;
            offset += size;
            (size > 0).then(|| Partition {
                device: device.clone(),
                range: start..offset,
            })
        })
        .collect()
}

/// 一个分片在一个 epoch 中产出的更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionUpdate {
    pub partition: Partition,
    pub update: Value,
}

/// 聚合策略
pub trait Aggregator: Send + Sync {
    /// 合并本 epoch 所有存活分片的更新
    fn aggregate(&self, updates: &[PartitionUpdate]) -> anyhow::Result<Value>;
}

/// 按分片样本数加权平均，默认策略
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedAverage;

/// 各分片等权平均
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleAverage;

impl Aggregator for WeightedAverage {
    fn aggregate(&self, updates: &[PartitionUpdate]) -> anyhow::Result<Value> {
        average(updates, |u| u.partition.len() as f64)
    }
}

impl Aggregator for SimpleAverage {
    fn aggregate(&self, updates: &[PartitionUpdate]) -> anyhow::Result<Value> {
        average(updates, |_| 1.0)
    }
}

/// 更新必须是等长的数值数组
fn average(updates: &[PartitionUpdate], weight: impl Fn(&PartitionUpdate) -> f64) -> anyhow::Result<Value> {
    if updates.is_empty() {
        bail!("no updates to aggregate");
    }
    let mut vectors = Vec::with_capacity(updates.len());
    for u in updates {
        let values = u
            .update
            .as_array()
            .with_context(|| format!("update from {} is not an array", u.partition.device))?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| anyhow!("non-numeric value {} from {}", v, u.partition.device)))
            .collect::<anyhow::Result<Vec<f64>>>()?;
        vectors.push(values);
    }
    let width = vectors[0].len();
    if let Some((u, v)) = updates.iter().zip(&vectors).find(|(_, v)| v.len() != width) {
        bail!(
            "update from {} has {} values, expected {}",
            u.partition.device,
            v.len(),
            width
        );
    }

    let weights: Vec<f64> = updates.iter().map(&weight).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        bail!("aggregation weights sum to zero");
    }
    let mut combined = vec![0.0; width];
    for (values, w) in vectors.iter().zip(&weights) {
        for (acc, v) in combined.iter_mut().zip(values) {
            *acc += v * w / total;
        }
    }
    Ok(Value::from(combined))
}

/// 一个 epoch 的结果
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: u32,
    /// 本 epoch 使用的模型快照
    pub snapshot_ref: String,
    pub partitions: Vec<Partition>,
    /// 任务最终失败而被排除的分片及原因
    pub lost: Vec<(Partition, String)>,
    pub aggregate: Value,
}

/// 分布式训练作业
pub struct TrainingJob {
    pub job_id: String,
    pub dataset_size: u64,
    pub epochs: u32,
    /// 远端处理分片时的批大小
    pub batch_size: u32,
    /// 第 0 个 epoch 的模型快照
    pub model_snapshot_ref: String,
    /// 每个分片任务的等待上限，`None` 表示一直等待
    pub chunk_timeout: Option<Duration>,
    aggregator: Box<dyn Aggregator>,
}

impl TrainingJob {
    pub fn new(job_id: impl Into<String>, dataset_size: u64, model_snapshot_ref: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            dataset_size,
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            model_snapshot_ref: model_snapshot_ref.into(),
            chunk_timeout: None,
            aggregator: Box::new(WeightedAverage),
        }
    }

    pub fn with_epochs(mut self, epochs: u32) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = Some(timeout);
        self
    }

    pub fn with_aggregator(mut self, aggregator: impl Aggregator + 'static) -> Self {
        self.aggregator = Box::new(aggregator);
        self
    }

    /// 第 `epoch` 个 epoch 读取的模型快照
    pub fn snapshot_for(&self, epoch: u32) -> String {
        if epoch == 0 {
            self.model_snapshot_ref.clone()
        } else {
            format!("{}@epoch{}", self.model_snapshot_ref, epoch)
        }
    }

    /// 依次运行所有 epoch，上一个 epoch 聚合完成后才开始下一个
    pub async fn run(&self, scheduler: &TaskScheduler) -> Result<Vec<EpochReport>> {
        let mut reports = Vec::with_capacity(self.epochs as usize);
        for epoch in 0..self.epochs {
            reports.push(self.run_epoch(scheduler, epoch).await?);
        }
        Ok(reports)
    }

    /// 按当前健康设备重新划分数据并运行一个 epoch
    pub async fn run_epoch(&self, scheduler: &TaskScheduler, epoch: u32) -> Result<EpochReport> {
        let partitions = partition_healthy(scheduler, self.dataset_size).await?;
        let snapshot_ref = self.snapshot_for(epoch);
        info!(job = %self.job_id, epoch, partitions = partitions.len(), "epoch started");

        let (results, lost) = dispatch_partitions(scheduler, &partitions, self.chunk_timeout, |p| {
            Work::TrainingChunk(ChunkDescriptor {
                job_id: self.job_id.clone(),
                epoch,
                dataset_range: p.range.clone(),
                model_snapshot_ref: snapshot_ref.clone(),
                batch_size: self.batch_size,
            })
        })
        .await?;
        if results.is_empty() {
            return Err(Error::Aggregation(anyhow!(
                "every partition of epoch {} failed",
                epoch
            )));
        }

        let updates: Vec<PartitionUpdate> = results
            .into_iter()
            .map(|(partition, update)| PartitionUpdate { partition, update })
            .collect();
        let aggregate = self.aggregator.aggregate(&updates)?;
        info!(job = %self.job_id, epoch, folded = updates.len(), lost = lost.len(), "epoch aggregated");
        Ok(EpochReport {
            epoch,
            snapshot_ref,
            partitions,
            lost,
            aggregate,
        })
    }
}

/// 一次推理的结果
#[derive(Debug, Clone)]
pub struct InferenceReport {
    pub partitions: Vec<Partition>,
    /// 存活分片的预测，按区间顺序拼接
    pub predictions: Vec<Value>,
    /// 任务最终失败的分片及原因，这些区间没有预测
    pub lost: Vec<(Partition, String)>,
}

/// 分布式推理作业：每个分片返回区间内逐样本的预测数组
pub struct InferenceJob {
    pub job_id: String,
    pub dataset_size: u64,
    pub model_snapshot_ref: String,
    pub batch_size: u32,
    /// 每个分片任务的等待上限，`None` 表示一直等待
    pub chunk_timeout: Option<Duration>,
}

impl InferenceJob {
    pub fn new(job_id: impl Into<String>, dataset_size: u64, model_snapshot_ref: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            dataset_size,
            model_snapshot_ref: model_snapshot_ref.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_timeout: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = Some(timeout);
        self
    }

    pub async fn run(&self, scheduler: &TaskScheduler) -> Result<InferenceReport> {
        let partitions = partition_healthy(scheduler, self.dataset_size).await?;
        info!(job = %self.job_id, partitions = partitions.len(), "inference started");

        let (results, lost) = dispatch_partitions(scheduler, &partitions, self.chunk_timeout, |p| {
            Work::InferenceChunk(InferenceChunk {
                job_id: self.job_id.clone(),
                dataset_range: p.range.clone(),
                model_snapshot_ref: self.model_snapshot_ref.clone(),
                batch_size: self.batch_size,
            })
        })
        .await?;
        if results.is_empty() && !partitions.is_empty() {
            return Err(Error::Aggregation(anyhow!(
                "every partition of inference job {} failed",
                self.job_id
            )));
        }

        let mut predictions = Vec::new();
        for (p, output) in results {
            let Value::Array(values) = output else {
                return Err(Error::Aggregation(anyhow!(
                    "predictions from {} are not an array",
                    p.device
                )));
            };
            if values.len() as u64 != p.len() {
                return Err(Error::Aggregation(anyhow!(
                    "{} returned {} predictions for {} samples",
                    p.device,
                    values.len(),
                    p.len()
                )));
            }
            predictions.extend(values);
        }
        info!(job = %self.job_id, predictions = predictions.len(), lost = lost.len(), "inference finished");
        Ok(InferenceReport {
            partitions,
            predictions,
            lost,
        })
    }
}

/// 按名称排序的健康设备划分数据集，设备不变时每次划分一致
async fn partition_healthy(scheduler: &TaskScheduler, dataset_size: u64) -> Result<Vec<Partition>> {
    let mut devices: Vec<(String, u32)> = scheduler
        .registry()
        .healthy_devices()
        .await
        .into_iter()
        .map(|d| (d.name, d.num_accelerators.unwrap_or(0)))
        .collect();
    if devices.is_empty() {
        return Err(Error::NoHealthyDevices);
    }
    devices.sort();
    Ok(partition(dataset_size, &devices))
}

/// 每个分片提交一个偏好其设备的任务，按区间顺序收集结果
///
/// 任务最终失败或被取消的分片记入 `lost`，其他错误直接返回。
async fn dispatch_partitions(
    scheduler: &TaskScheduler,
    partitions: &[Partition],
    timeout: Option<Duration>,
    work_for: impl Fn(&Partition) -> Work,
) -> Result<(Vec<(Partition, Value)>, Vec<(Partition, String)>)> {
    let mut submitted: Vec<(Partition, TaskId)> = Vec::with_capacity(partitions.len());
    for p in partitions {
        let task_id = scheduler
            .submit_with(work_for(p), SubmitOptions::default().prefer(p.device.clone()))
            .await?;
        submitted.push((p.clone(), task_id));
    }

    let mut results = Vec::with_capacity(submitted.len());
    let mut lost = Vec::new();
    for (p, task_id) in submitted {
        match scheduler.wait_for_result(task_id, timeout).await {
            Ok(value) => results.push((p, value)),
            Err(e @ (Error::TaskFailed { .. } | Error::Cancelled(_))) => {
                warn!(device = %p.device, range = ?p.range, error = %e, "partition excluded");
                lost.push((p, e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
    Ok((results, lost))
}
