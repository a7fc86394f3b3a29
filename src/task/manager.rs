use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use chrono::Utc;

use super::types::{ItemKind, TaskStatus, TaskEvent};
use super::models::{RegisteredFile, SubTask, Task, TaskSummary, TreeVerdict};
use crate::error::UploadError;

/// 任务管理器（内存存储，状态变化通过 broadcast 推送）
///
/// 所有操作都是同步的：持锁期间不会 await，调度器可以在一次调用内
/// 完成“准入 → 标记”而不被其他任务插入。
#[derive(Clone)]
pub struct TaskManager {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    next_seq: Arc<AtomicU64>,
    event_sender: broadcast::Sender<TaskEvent>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(256);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            event_sender,
        }
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_sender.subscribe()
    }

    /// 广播事件
    pub fn broadcast(&self, event: TaskEvent) {
        let _ = self.event_sender.send(event);
    }

    /// 在写锁内修改任务，返回修改后的快照（锁已释放）
    fn mutate<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> Option<R>) -> Option<(R, Task)> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(task_id)?;
        let result = f(task)?;
        let task_clone = task.clone();
        drop(tasks);
        Some((result, task_clone))
    }

    /// 添加任务
    pub fn add_task(&self, mut task: Task) -> Result<(), UploadError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(UploadError::Validation(format!("task id already exists: {}", task.id)));
        }
        task.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tasks.insert(task.id.clone(), task.clone());
        drop(tasks);
        self.broadcast(TaskEvent::TaskCreated { task: TaskSummary::from(&task) });
        Ok(())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.read().contains_key(task_id)
    }

    /// 准入：queued → uploading，并记录本次执行的 upload_id
    pub fn mark_admitted(&self, task_id: &str, upload_id: &str) -> bool {
        let updated = self.mutate(task_id, |task| {
            if task.status != TaskStatus::Queued {
                tracing::warn!("Task {} admitted from state {:?}", task.id, task.status);
                return None;
            }
            task.status = TaskStatus::Uploading;
            task.upload_id = Some(upload_id.to_string());
            task.started_at = Some(Utc::now());
            Some(())
        });
        match updated {
            Some((_, task)) => {
                self.broadcast(TaskEvent::TaskUpdated { task: TaskSummary::from(&task) });
                true
            }
            None => false,
        }
    }

    /// 更新非终态状态与进度（进度只增不减）
    pub fn update_status(&self, task_id: &str, status: TaskStatus, progress: Option<f32>) -> bool {
        if status.is_terminal() {
            tracing::warn!("Task {}: terminal state {:?} must go through complete/fail/settle", task_id, status);
            return false;
        }
        let updated = self.mutate(task_id, |task| {
            if !task.status.can_transition_to(status) {
                tracing::warn!("Task {}: ignoring transition {:?} -> {:?}", task.id, task.status, status);
                return None;
            }
            task.status = status;
            if let Some(p) = progress {
                task.progress = p.clamp(0.0, 100.0).max(task.progress);
            }
            Some(())
        });
        match updated {
            Some((_, task)) => {
                self.broadcast(TaskEvent::TaskUpdated { task: TaskSummary::from(&task) });
                true
            }
            None => false,
        }
    }

    /// 单文件任务完成
    pub fn complete_task(&self, task_id: &str, registered: RegisteredFile) -> bool {
        let updated = self.mutate(task_id, |task| {
            if task.item_kind == ItemKind::Tree {
                tracing::warn!("Task {}: tree tasks are settled from their sub-tasks", task.id);
                return None;
            }
            if !task.status.can_transition_to(TaskStatus::Completed) {
                tracing::warn!("Task {}: cannot complete from {:?}", task.id, task.status);
                return None;
            }
            task.status = TaskStatus::Completed;
            task.progress = 100.0;
            task.error = None;
            task.registered = Some(registered);
            task.finished_at = Some(Utc::now());
            Some(())
        });
        match updated {
            Some((_, task)) => {
                self.broadcast(TaskEvent::TaskCompleted { task: TaskSummary::from(&task) });
                true
            }
            None => false,
        }
    }

    /// 任务失败
    pub fn fail_task(&self, task_id: &str, error: String) -> bool {
        let updated = self.mutate(task_id, |task| {
            if task.status.is_terminal() {
                return None;
            }
            task.status = TaskStatus::Failed;
            task.error = Some(error);
            task.finished_at = Some(Utc::now());
            Some(())
        });
        match updated {
            Some((_, task)) => {
                self.broadcast(TaskEvent::TaskFailed { task: TaskSummary::from(&task) });
                true
            }
            None => false,
        }
    }

    /// 添加子任务，返回子任务 ID
    pub fn add_sub_task(&self, task_id: &str, name: &str, relative_path: &str) -> Option<String> {
        let (sub_id, task) = self.mutate(task_id, |task| {
            if task.item_kind != ItemKind::Tree || task.status.is_terminal() {
                return None;
            }
            let sub = SubTask::new(name.to_string(), relative_path.to_string());
            let sub_id = sub.id.clone();
            task.sub_tasks.push(sub);
            task.progress = task.mean_sub_task_progress();
            Some(sub_id)
        })?;
        self.broadcast(TaskEvent::TaskUpdated { task: TaskSummary::from(&task) });
        Some(sub_id)
    }

    fn mutate_sub_task(
        &self,
        task_id: &str,
        sub_id: &str,
        f: impl FnOnce(&mut SubTask) -> bool,
    ) -> Option<f32> {
        let (progress, task) = self.mutate(task_id, |task| {
            let sub = task.sub_tasks.iter_mut().find(|s| s.id == sub_id)?;
            if sub.status.is_terminal() || !f(sub) {
                return None;
            }
            task.progress = task.mean_sub_task_progress();
            Some(task.progress)
        })?;
        self.broadcast(TaskEvent::TaskUpdated { task: TaskSummary::from(&task) });
        Some(progress)
    }

    /// 更新子任务状态与进度，返回父任务的平均进度
    pub fn update_sub_task(&self, task_id: &str, sub_id: &str, status: TaskStatus, progress: f32) -> Option<f32> {
        if status.is_terminal() {
            return None;
        }
        self.mutate_sub_task(task_id, sub_id, |sub| {
            if !sub.status.can_transition_to(status) {
                tracing::warn!("Sub-task {}: ignoring transition {:?} -> {:?}", sub.id, sub.status, status);
                return false;
            }
            sub.status = status;
            sub.progress = progress.clamp(0.0, 100.0).max(sub.progress);
            true
        })
    }

    pub fn complete_sub_task(&self, task_id: &str, sub_id: &str, registered: RegisteredFile) -> Option<f32> {
        self.mutate_sub_task(task_id, sub_id, |sub| {
            sub.status = TaskStatus::Completed;
            sub.progress = 100.0;
            sub.registered = Some(registered);
            true
        })
    }

    pub fn fail_sub_task(&self, task_id: &str, sub_id: &str, error: String) -> Option<f32> {
        self.mutate_sub_task(task_id, sub_id, |sub| {
            sub.status = TaskStatus::Failed;
            sub.error = Some(error);
            true
        })
    }

    /// 根据子任务推导目录任务的终态；仍有未结束的子任务时返回 None
    pub fn settle_tree(&self, task_id: &str) -> Option<TreeVerdict> {
        let (verdict, task) = self.mutate(task_id, |task| {
            if task.item_kind != ItemKind::Tree || task.status.is_terminal() {
                return None;
            }
            if task.sub_tasks.iter().any(|s| !s.status.is_terminal()) {
                tracing::warn!("Task {}: cannot settle while sub-tasks are running", task.id);
                return None;
            }
            let verdict = task.tree_verdict();
            task.status = verdict.status();
            task.error = verdict.error();
            task.progress = task.mean_sub_task_progress();
            task.finished_at = Some(Utc::now());
            Some(verdict)
        })?;
        let summary = TaskSummary::from(&task);
        if verdict.status() == TaskStatus::Failed {
            self.broadcast(TaskEvent::TaskFailed { task: summary });
        } else {
            self.broadcast(TaskEvent::TaskCompleted { task: summary });
        }
        Some(verdict)
    }

    /// 获取任务
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    /// 按本次执行的 upload_id 查找任务
    pub fn find_by_upload_id(&self, upload_id: &str) -> Option<Task> {
        self.tasks
            .read()
            .values()
            .find(|t| t.upload_id.as_deref() == Some(upload_id))
            .cloned()
    }

    /// 获取所有任务（按创建时间倒序）
    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.seq.cmp(&a.seq)));
        tasks
    }

    /// 删除指定任务
    pub fn remove_task(&self, task_id: &str) -> Option<Task> {
        let removed = self.tasks.write().remove(task_id);
        if removed.is_some() {
            self.broadcast(TaskEvent::TaskRemoved { id: task_id.to_string() });
        }
        removed
    }

    /// 删除所有终态任务
    pub fn clear_terminal(&self) -> Vec<Task> {
        let mut tasks = self.tasks.write();
        let mut removed: Vec<Task> = Vec::new();
        tasks.retain(|_, t| {
            let keep = !t.status.is_terminal();
            if !keep {
                removed.push(t.clone());
            }
            keep
        });
        drop(tasks);

        for task in &removed {
            self.broadcast(TaskEvent::TaskRemoved { id: task.id.clone() });
        }
        removed
    }

    /// 删除全部任务（运行中的任务只是不再被观察）
    pub fn clear_all(&self) -> Vec<Task> {
        let removed: Vec<Task> = self.tasks.write().drain().map(|(_, t)| t).collect();
        for task in &removed {
            self.broadcast(TaskEvent::TaskRemoved { id: task.id.clone() });
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
