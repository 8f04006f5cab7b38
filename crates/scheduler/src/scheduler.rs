// scheduler.rs
// 任务调度器：维护任务表与待分配队列，按容量和延迟把任务分配给健康设备，并处理重试、取消与关闭。
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::device::Device;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{Attempt, Error, Result};
use crate::executor::RemoteExecutor;
use crate::registry::DeviceRegistry;
use crate::task::{SubmitOptions, TaskId, TaskState, Work};

/// 关闭方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// 停止接收新任务，等待已提交的任务全部结束
    ///
    /// 没有健康设备时，仍在排队的任务无法再被分配，转为 `Cancelled`。
    Drain,
    /// 取消尚未运行的任务，只等待正在运行的任务
    Cancel,
}

/// 任务表中的一条记录
struct TaskRecord {
    work: Arc<Work>,
    options: SubmitOptions,
    /// 当前状态，等待者通过订阅得知状态变化
    state: watch::Sender<TaskState>,
    attempts: Vec<Attempt>,
    finished_at: Option<Instant>,
}

impl TaskRecord {
    fn current(&self) -> TaskState {
        self.state.borrow().clone()
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), TaskState::Pending)
    }

    fn finish(&mut self, state: TaskState) {
        self.finished_at = Some(Instant::now());
        self.state.send_replace(state);
    }

    fn tried(&self, device: &str) -> bool {
        self.attempts.iter().any(|a| a.device == device)
    }
}

/// 任务状态迁移与设备占用计数都在同一把锁下修改
#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, TaskRecord>,
    /// 待分配任务，先进先出；失败重试的任务插到队首
    pending: VecDeque<TaskId>,
    /// 每台设备上已分配或运行中的任务数
    in_flight: HashMap<String, usize>,
    /// 一旦设置就不再接收新任务
    closing: Option<ShutdownMode>,
}

impl TaskTable {
    fn release(&mut self, device: &str) {
        if let Some(count) = self.in_flight.get_mut(device) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(device);
            }
        }
    }
}

/// 一次待启动的分配
struct Launch {
    task_id: TaskId,
    work: Arc<Work>,
    device: Device,
    deadline: Duration,
}

struct Inner {
    registry: DeviceRegistry,
    dispatcher: Dispatcher,
    config: SchedulerConfig,
    table: Mutex<TaskTable>,
    /// 提交、完成时唤醒分配循环
    wake: Notify,
    stop: CancellationToken,
}

/// 分布式任务调度器
///
/// 构造时会在当前 tokio 运行时上启动后台分配循环，因此必须在运行时内调用 `new`。
/// 调度器从不在持有任务表锁时等待注册表：先取健康设备快照，再加锁分配。
pub struct TaskScheduler {
    inner: Arc<Inner>,
    assign_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// 创建调度器并启动分配循环
    pub fn new(
        registry: DeviceRegistry,
        executor: Arc<dyn RemoteExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(executor, config.worker_command.clone());
        let inner = Arc::new(Inner {
            registry,
            dispatcher,
            config,
            table: Mutex::new(TaskTable::default()),
            wake: Notify::new(),
            stop: CancellationToken::new(),
        });
        let assign_loop = tokio::spawn(Inner::run(inner.clone()));
        Self {
            inner,
            assign_loop: Mutex::new(Some(assign_loop)),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// 提交任务，立即返回任务 ID
    pub async fn submit(&self, work: Work) -> Result<TaskId> {
        self.submit_with(work, SubmitOptions::default()).await
    }

    /// 带超时覆盖或设备偏好提交任务
    pub async fn submit_with(&self, work: Work, options: SubmitOptions) -> Result<TaskId> {
        let task_id = TaskId::new();
        {
            let mut table = self.inner.table.lock().await;
            if table.closing.is_some() {
                return Err(Error::ShutDown);
            }
            debug!(%task_id, work = %work.label(), "task submitted");
            let (state, _) = watch::channel(TaskState::Pending);
            table.tasks.insert(
                task_id,
                TaskRecord {
                    work: Arc::new(work),
                    options,
                    state,
                    attempts: Vec::new(),
                    finished_at: None,
                },
            );
            table.pending.push_back(task_id);
        }
        self.inner.wake.notify_one();
        Ok(task_id)
    }

    /// 等待任务进入终态并取走结果
    ///
    /// 超时不会取消任务。成功取走终态后任务从任务表中移除，再次查询会得到 `UnknownTask`。
    pub async fn wait_for_result(&self, task_id: TaskId, timeout: Option<Duration>) -> Result<Value> {
        let mut state = {
            let table = self.inner.table.lock().await;
            table
                .tasks
                .get(&task_id)
                .ok_or(Error::UnknownTask(task_id))?
                .state
                .subscribe()
        };

        let terminal = async move { state.wait_for(TaskState::is_terminal).await.map(|_| ()) };
        let reached = match timeout {
            Some(waited) => tokio::time::timeout(waited, terminal)
                .await
                .map_err(|_| Error::Timeout { task_id, waited })?,
            None => terminal.await,
        };
        // 发送端被丢弃说明记录已被其他等待者取走或已过期
        reached.map_err(|_| Error::UnknownTask(task_id))?;

        let record = self
            .inner
            .table
            .lock()
            .await
            .tasks
            .remove(&task_id)
            .ok_or(Error::UnknownTask(task_id))?;
        match record.current() {
            TaskState::Completed(value) => Ok(value),
            TaskState::Cancelled => Err(Error::Cancelled(task_id)),
            _ => Err(Error::TaskFailed {
                task_id,
                attempts: record.attempts,
            }),
        }
    }

    /// 取消任务，仅在 `Pending` 或 `Assigned` 时有效
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        let mut table = self.inner.table.lock().await;
        let state = table
            .tasks
            .get(&task_id)
            .map(TaskRecord::current)
            .ok_or(Error::UnknownTask(task_id))?;
        match state {
            TaskState::Pending => table.pending.retain(|id| *id != task_id),
            TaskState::Assigned(device) => table.release(&device),
            other => {
                return Err(Error::NotCancellable {
                    task_id,
                    state: other.name().to_string(),
                })
            }
        }
        if let Some(record) = table.tasks.get_mut(&task_id) {
            record.finish(TaskState::Cancelled);
        }
        info!(%task_id, "task cancelled");
        drop(table);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 任务当前状态的快照
    pub async fn task_state(&self, task_id: TaskId) -> Result<TaskState> {
        let table = self.inner.table.lock().await;
        table
            .tasks
            .get(&task_id)
            .map(TaskRecord::current)
            .ok_or(Error::UnknownTask(task_id))
    }

    /// 已分配或运行中的任务数，按设备统计
    pub async fn in_flight(&self) -> HashMap<String, usize> {
        self.inner.table.lock().await.in_flight.clone()
    }

    /// 关闭调度器并停止分配循环
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        let mut waiting = Vec::new();
        {
            let mut guard = self.inner.table.lock().await;
            let table = &mut *guard;
            if table.closing.is_none() {
                table.closing = Some(mode);
            }
            if mode == ShutdownMode::Cancel {
                table.pending.clear();
                let mut released = Vec::new();
                for record in table.tasks.values_mut() {
                    match record.current() {
                        TaskState::Pending => record.finish(TaskState::Cancelled),
                        TaskState::Assigned(device) => {
                            released.push(device);
                            record.finish(TaskState::Cancelled);
                        }
                        _ => {}
                    }
                }
                for device in released {
                    table.release(&device);
                }
            }
            for record in table.tasks.values() {
                if !record.current().is_terminal() {
                    waiting.push(record.state.subscribe());
                }
            }
        }
        info!(?mode, remaining = waiting.len(), "scheduler shutting down");
        // 让分配循环立即检查 Drain 下是否还有设备可用
        self.inner.wake.notify_one();

        for mut state in waiting {
            // 记录被取走时发送端随之丢弃，同样视为结束
            let _ = state.wait_for(TaskState::is_terminal).await.map(|_| ());
        }

        self.inner.stop.cancel();
        if let Some(handle) = self.assign_loop.lock().await.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tick.tick() => self.collect_expired().await,
            }
            self.assign_pending().await;
        }
        debug!("assignment loop stopped");
    }

    /// 清理超过保留期仍未被取走的终态结果
    async fn collect_expired(&self) {
        let ttl = self.config.result_ttl;
        let mut table = self.table.lock().await;
        let before = table.tasks.len();
        table
            .tasks
            .retain(|_, record| record.finished_at.map_or(true, |at| at.elapsed() < ttl));
        let expired = before - table.tasks.len();
        if expired > 0 {
            debug!(expired, "dropped unretrieved results");
        }
    }

    /// 按先进先出顺序扫描待分配队列，能放下的任务立即分配
    async fn assign_pending(self: &Arc<Self>) {
        let devices = self.registry.healthy_devices().await;
        if devices.is_empty() {
            self.abandon_pending().await;
            return;
        }

        let mut launches = Vec::new();
        {
            let mut guard = self.table.lock().await;
            let table = &mut *guard;
            if table.closing == Some(ShutdownMode::Cancel) {
                return;
            }
            let mut still_pending = VecDeque::with_capacity(table.pending.len());
            while let Some(task_id) = table.pending.pop_front() {
                let Some(record) = table.tasks.get_mut(&task_id) else {
                    continue;
                };
                if !record.is_pending() {
                    continue;
                }
                let per_accelerator = self.config.tasks_per_accelerator;
                let Some(device) = pick_device(&devices, record, &table.in_flight, per_accelerator)
                else {
                    // 放不下的任务留在原位，后面的任务仍可使用空闲容量
                    still_pending.push_back(task_id);
                    continue;
                };
                *table.in_flight.entry(device.name.clone()).or_insert(0) += 1;
                record.state.send_replace(TaskState::Assigned(device.name.clone()));
                let deadline = record
                    .options
                    .timeout
                    .unwrap_or_else(|| self.config.dispatch_timeout(device.average_latency));
                debug!(%task_id, device = %device.name, attempt = record.attempts.len() + 1, "task assigned");
                launches.push(Launch {
                    task_id,
                    work: record.work.clone(),
                    device: device.clone(),
                    deadline,
                });
            }
            table.pending = still_pending;
        }

        for launch in launches {
            tokio::spawn(self.clone().run_attempt(launch));
        }
    }

    /// Drain 期间没有健康设备时取消所有排队任务，关闭不会无限等待
    async fn abandon_pending(&self) {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;
        if table.closing != Some(ShutdownMode::Drain) || table.pending.is_empty() {
            return;
        }
        let mut abandoned = 0;
        for task_id in table.pending.drain(..) {
            if let Some(record) = table.tasks.get_mut(&task_id) {
                if record.is_pending() {
                    record.finish(TaskState::Cancelled);
                    abandoned += 1;
                }
            }
        }
        warn!(abandoned, "no healthy device left while draining, pending tasks cancelled");
    }

    /// 执行一次分配；每次尝试恰好调用一次 `record_success` 或 `record_failure`
    async fn run_attempt(self: Arc<Self>, launch: Launch) {
        let Launch {
            task_id,
            work,
            device,
            deadline,
        } = launch;
        if !self.mark_running(task_id, &device.name).await {
            return;
        }

        match self.dispatcher.execute(task_id, &work, &device, deadline).await {
            DispatchOutcome::Success(value) => self.record_success(task_id, &device.name, value).await,
            DispatchOutcome::RemoteError(reason) => {
                self.record_failure(task_id, &device.name, reason, false).await
            }
            DispatchOutcome::Unreachable(reason) => {
                // 先下线设备，重新排队时就不会再选中它
                if let Err(e) = self.registry.mark_unreachable(&device.name, &reason).await {
                    warn!(device = %device.name, error = %e, "cannot mark device unreachable");
                }
                self.record_failure(task_id, &device.name, reason, true).await
            }
        }
        self.wake.notify_one();
    }

    /// `Assigned -> Running`；任务在此之前被取消则返回 false
    async fn mark_running(&self, task_id: TaskId, device: &str) -> bool {
        let table = self.table.lock().await;
        match table.tasks.get(&task_id) {
            Some(record) if record.current() == TaskState::Assigned(device.to_string()) => {
                record.state.send_replace(TaskState::Running(device.to_string()));
                true
            }
            _ => false,
        }
    }

    async fn record_success(&self, task_id: TaskId, device: &str, value: Value) {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;
        table.release(device);
        if let Some(record) = table.tasks.get_mut(&task_id) {
            info!(%task_id, device, attempts = record.attempts.len() + 1, "task completed");
            record.finish(TaskState::Completed(value));
        }
    }

    async fn record_failure(&self, task_id: TaskId, device: &str, reason: String, device_fault: bool) {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;
        table.release(device);
        let Some(record) = table.tasks.get_mut(&task_id) else {
            return;
        };
        warn!(%task_id, device, device_fault, %reason, "attempt failed");
        record.attempts.push(Attempt {
            device: device.to_string(),
            reason,
            device_fault,
        });

        let exhausted = record.attempts.len() >= self.config.max_retries.max(1) as usize;
        if exhausted || table.closing == Some(ShutdownMode::Cancel) {
            info!(%task_id, attempts = record.attempts.len(), "task failed");
            record.finish(TaskState::Failed);
        } else {
            record.state.send_replace(TaskState::Pending);
            table.pending.push_front(task_id);
        }
    }
}

/// 为任务挑选设备
///
/// 优先考虑偏好设备，其次按排名选择未失败过的设备；只有所有健康设备都失败过时才回到已尝试的设备。
fn pick_device<'a>(
    ranked: &'a [Device],
    record: &TaskRecord,
    in_flight: &HashMap<String, usize>,
    tasks_per_accelerator: usize,
) -> Option<&'a Device> {
    let has_room = |d: &Device| in_flight.get(&d.name).copied().unwrap_or(0) < d.capacity(tasks_per_accelerator);
    let any_untried = ranked.iter().any(|d| !record.tried(&d.name));

    if let Some(preferred) = record.options.preferred_device.as_deref() {
        if let Some(device) = ranked.iter().find(|d| d.name == preferred) {
            if has_room(device) && !record.tried(&device.name) {
                return Some(device);
            }
        }
    }
    ranked
        .iter()
        .filter(|d| !any_untried || !record.tried(&d.name))
        .find(|d| has_room(*d))
}
