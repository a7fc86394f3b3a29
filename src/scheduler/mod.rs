//! Concurrency-limited scheduler / 并发受限的上传调度器
//!
//! Two admission counters (local-origin, remote-origin) bound the tasks in
//! flight; url-fetch tasks are never counted. Every finished task releases its
//! slot before its terminal state is reported, then the pending queue is
//! scanned again from the front.

pub mod job;
pub mod reporter;

pub use job::*;
pub use reporter::*;

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::UploadError;
use crate::progress::{FileResult, ProgressEvent, ProgressReceiver, ProgressRegistry, ProgressStatus};
use crate::task::{
    AdmissionClass, ItemKind, OriginClass, RegisteredFile, Task, TaskManager, TaskStatus, TreeVerdict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    pub max_local: usize,
    pub max_remote: usize,
}

impl From<&SchedulerConfig> for SchedulerLimits {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_local: config.max_local_uploads.max(1),
            max_remote: config.max_remote_uploads.max(1),
        }
    }
}

/// 调度器诊断信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub active_local: usize,
    pub active_remote: usize,
    pub active_url_fetch: usize,
    pub pending: usize,
}

/// 任务执行结果
#[derive(Debug)]
pub enum TaskOutcome {
    /// Single item registered with the metadata service
    Registered(RegisteredFile),
    /// Per-file outcomes of a tree; the verdict is derived from the sub-tasks
    Tree(Vec<FileResult>),
    Failed(UploadError),
}

/// Executes one admitted job. Runs inside the job's slot.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, job: UploadJob, reporter: TaskReporter) -> TaskOutcome;
}

#[derive(Default)]
struct SchedulerState {
    pending: VecDeque<UploadJob>,
    active_local: usize,
    active_remote: usize,
    active_url_fetch: usize,
}

impl SchedulerState {
    fn can_admit(&self, limits: &SchedulerLimits, class: OriginClass) -> bool {
        match class.admission_class() {
            Some(AdmissionClass::Local) => self.active_local < limits.max_local,
            Some(AdmissionClass::Remote) => self.active_remote < limits.max_remote,
            None => true,
        }
    }

    fn acquire(&mut self, class: OriginClass) {
        match class.admission_class() {
            Some(AdmissionClass::Local) => self.active_local += 1,
            Some(AdmissionClass::Remote) => self.active_remote += 1,
            None => self.active_url_fetch += 1,
        }
    }

    fn release(&mut self, class: OriginClass) {
        let counter = match class.admission_class() {
            Some(AdmissionClass::Local) => &mut self.active_local,
            Some(AdmissionClass::Remote) => &mut self.active_remote,
            None => &mut self.active_url_fetch,
        };
        if *counter == 0 {
            warn!("Admission counter for {:?} released below zero", class);
            return;
        }
        *counter -= 1;
    }

    /// 从队首开始找第一个可准入的任务；被阻塞的类别不阻挡其他类别
    fn take_admittable(&mut self, limits: &SchedulerLimits) -> Option<UploadJob> {
        let index = (0..self.pending.len()).find(|&i| self.can_admit(limits, self.pending[i].origin_class()))?;
        let job = self.pending.remove(index)?;
        self.acquire(job.origin_class());
        Some(job)
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active_local: self.active_local,
            active_remote: self.active_remote,
            active_url_fetch: self.active_url_fetch,
            pending: self.pending.len(),
        }
    }
}

struct SchedulerInner {
    limits: SchedulerLimits,
    state: Mutex<SchedulerState>,
    tasks: TaskManager,
    progress: ProgressRegistry,
    runner: Arc<dyn TaskRunner>,
}

/// 准入名额；丢弃时归还并重新扫描队列
struct SlotGuard {
    inner: Arc<SchedulerInner>,
    class: OriginClass,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.state.lock().release(self.class);
        pump(&self.inner);
    }
}

#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<SchedulerInner>,
}

impl UploadScheduler {
    pub fn new(
        limits: SchedulerLimits,
        tasks: TaskManager,
        progress: ProgressRegistry,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                limits,
                state: Mutex::new(SchedulerState::default()),
                tasks,
                progress,
                runner,
            }),
        }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.inner.progress
    }

    pub fn limits(&self) -> SchedulerLimits {
        self.inner.limits
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.state.lock().stats()
    }

    /// 订阅一次上传的进度
    ///
    /// An upload that already finished gets its terminal event replayed, and an
    /// id no task carries (unknown, removed or cleared) is closed with a failure
    /// right away, so every subscription ends.
    pub fn observe(&self, upload_id: &str) -> ProgressReceiver {
        let progress = &self.inner.progress;
        let rx = progress.open(upload_id);
        match self.inner.tasks.find_by_upload_id(upload_id) {
            Some(task) => {
                if let Some(event) = terminal_event(&task) {
                    debug!("Upload {} already finished, replaying terminal event", upload_id);
                    progress.close(upload_id, Some(event));
                }
            }
            None => {
                debug!("No task for upload {}, closing its channel", upload_id);
                let error = UploadError::NotFound(format!("upload {}", upload_id));
                progress.close(
                    upload_id,
                    Some(ProgressEvent::new(ProgressStatus::Failed, 0.0).with_error(error.to_string())),
                );
            }
        }
        rx
    }

    /// 提交任务：记录为 queued 后立即尝试准入，返回任务 ID
    pub fn submit(&self, job: UploadJob) -> Result<String, UploadError> {
        let task = job.to_task();
        let task_id = task.id.clone();
        self.inner.tasks.add_task(task)?;
        info!(
            "Task {} queued: {} ({:?}, {:?})",
            task_id,
            job.name,
            job.item_kind,
            job.origin_class()
        );
        self.inner.state.lock().pending.push_back(job);
        pump(&self.inner);
        Ok(task_id)
    }

    /// 删除任务
    ///
    /// A queued task is dropped from the queue together with its staged
    /// bytes. An admitted task keeps running, only its observation is
    /// detached.
    pub fn remove_task(&self, task_id: &str) -> Option<Task> {
        let queued = {
            let mut state = self.inner.state.lock();
            let index = state.pending.iter().position(|job| job.id == task_id);
            index.and_then(|i| state.pending.remove(i))
        };
        if let Some(job) = queued {
            debug!("Dropped queued job {} ({})", job.id, job.name);
        }

        let removed = self.inner.tasks.remove_task(task_id)?;
        self.close_removed(&removed);
        info!("Task {} removed", task_id);
        Some(removed)
    }

    /// 清除已结束的任务
    pub fn clear_terminal(&self) -> Vec<Task> {
        let removed = self.inner.tasks.clear_terminal();
        if !removed.is_empty() {
            info!("Cleared {} finished tasks", removed.len());
        }
        removed
    }

    /// 清除全部任务：排队中的直接丢弃，执行中的只解除观察
    pub fn clear_all(&self) -> Vec<Task> {
        let dropped: Vec<UploadJob> = self.inner.state.lock().pending.drain(..).collect();
        let removed = self.inner.tasks.clear_all();
        for task in &removed {
            self.close_removed(task);
        }
        info!("Cleared all tasks ({} removed, {} dequeued)", removed.len(), dropped.len());
        removed
    }

    fn close_removed(&self, task: &Task) {
        if let Some(upload_id) = &task.upload_id {
            let event = ProgressEvent::new(ProgressStatus::Removed, task.progress).with_message("Task removed.");
            self.inner.progress.close(upload_id, Some(event));
        }
    }
}

fn terminal_event(task: &Task) -> Option<ProgressEvent> {
    let status = match task.status {
        TaskStatus::Completed => ProgressStatus::Completed,
        TaskStatus::CompletedWithErrors => ProgressStatus::CompletedWithErrors,
        TaskStatus::Failed => ProgressStatus::Failed,
        _ => return None,
    };
    let mut event = ProgressEvent::new(status, task.progress).with_file_name(task.name.clone());
    if let Some(registered) = &task.registered {
        event = event.with_registered(registered);
    }
    if let Some(error) = &task.error {
        event = event.with_error(error.clone());
    }
    Some(event)
}

/// Admit as many pending jobs as the counters allow.
fn pump(inner: &Arc<SchedulerInner>) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!("No runtime available, pending uploads stay queued");
            return;
        }
    };

    loop {
        let mut state = inner.state.lock();
        let Some(job) = state.take_admittable(&inner.limits) else {
            break;
        };
        let class = job.origin_class();
        let upload_id = uuid::Uuid::new_v4().to_string();

        // 记录已被删除：丢弃任务并归还名额
        if !inner.tasks.mark_admitted(&job.id, &upload_id) {
            warn!("Task {} vanished before admission, dropping it", job.id);
            state.release(class);
            drop(state);
            drop(job);
            continue;
        }
        drop(state);

        debug!("Task {} admitted as upload {}", job.id, upload_id);
        let slot = SlotGuard { inner: inner.clone(), class };
        handle.spawn(run_job(inner.clone(), job, slot, upload_id));
    }
}

async fn run_job(inner: Arc<SchedulerInner>, job: UploadJob, slot: SlotGuard, upload_id: String) {
    let started = Instant::now();
    let task_id = job.id.clone();
    let name = job.name.clone();
    let item_kind = job.item_kind;
    let reporter = TaskReporter::new(
        task_id.clone(),
        upload_id,
        inner.tasks.clone(),
        inner.progress.clone(),
    );

    let outcome = match AssertUnwindSafe(inner.runner.run(job, reporter.clone()))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("Task {} panicked", task_id);
            TaskOutcome::Failed(UploadError::Internal("upload task panicked".to_string()))
        }
    };

    // 先归还名额，再上报终态
    drop(slot);

    let final_event = settle(&inner.tasks, &task_id, &name, item_kind, outcome);
    reporter.finish(final_event);
    info!("Task {} finished in {} ms", task_id, started.elapsed().as_millis());
}

/// Write the terminal state on the record and build the channel's last event.
fn settle(
    tasks: &TaskManager,
    task_id: &str,
    name: &str,
    item_kind: ItemKind,
    outcome: TaskOutcome,
) -> ProgressEvent {
    match outcome {
        TaskOutcome::Registered(registered) => {
            tasks.complete_task(task_id, registered.clone());
            info!("Task {} registered {} as {}", task_id, registered.path, registered.id);
            ProgressEvent::new(ProgressStatus::Completed, 100.0)
                .with_message("Upload completed successfully.")
                .with_file_name(name)
                .with_registered(&registered)
        }
        TaskOutcome::Failed(err) => {
            error!("Task {} failed: {}", task_id, err);
            tasks.fail_task(task_id, err.to_string());
            ProgressEvent::new(ProgressStatus::Failed, 0.0)
                .with_message(format!("Upload failed: {}", name))
                .with_error(err.to_string())
        }
        TaskOutcome::Tree(results) => {
            let verdict = match tasks.settle_tree(task_id) {
                Some(verdict) => verdict,
                None => {
                    let failed = results.iter().filter(|r| !r.success).count();
                    let verdict = TreeVerdict::from_counts(results.len(), failed);
                    if item_kind == ItemKind::Tree && tasks.contains(task_id) {
                        warn!("Task {} could not be settled from its sub-tasks", task_id);
                        if verdict.status() == TaskStatus::Failed {
                            tasks.fail_task(task_id, verdict.message());
                        }
                    }
                    verdict
                }
            };
            let status = match verdict.status() {
                TaskStatus::Completed => ProgressStatus::Completed,
                TaskStatus::CompletedWithErrors => ProgressStatus::CompletedWithErrors,
                _ => ProgressStatus::Failed,
            };
            let progress = if status == ProgressStatus::Failed { 0.0 } else { 100.0 };
            info!("Task {} settled: {}", task_id, verdict.message());

            let mut event = ProgressEvent::new(status, progress)
                .with_message(verdict.message())
                .with_results(results);
            if let Some(error) = verdict.error() {
                event = event.with_error(error);
            }
            event
        }
    }
}
