//! Bridges stage progress into the task model and the progress channel.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::UploadError;
use crate::progress::{ProgressEvent, ProgressRegistry, ProgressStatus};
use crate::task::{RegisteredFile, TaskManager, TaskStatus};
use crate::upload::StageSink;

/// 单个任务执行期间的进度上报器
///
/// 通道上的进度只增不减；任务记录被删除后所有上报变为空操作。
#[derive(Clone)]
pub struct TaskReporter {
    task_id: String,
    upload_id: String,
    tasks: TaskManager,
    progress: ProgressRegistry,
    last_progress: Arc<Mutex<f32>>,
}

impl TaskReporter {
    pub fn new(task_id: String, upload_id: String, tasks: TaskManager, progress: ProgressRegistry) -> Self {
        Self {
            task_id,
            upload_id,
            tasks,
            progress,
            last_progress: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// 通道上最近一次上报的进度
    pub fn current_progress(&self) -> f32 {
        *self.last_progress.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.tasks.contains(&self.task_id)
    }

    fn clamp(&self, event: &mut ProgressEvent) {
        let mut last = self.last_progress.lock();
        if event.progress < *last {
            event.progress = *last;
        } else {
            *last = event.progress;
        }
    }

    /// Push an event on the task's channel.
    pub fn emit(&self, mut event: ProgressEvent) {
        if !self.is_attached() {
            return;
        }
        self.clamp(&mut event);
        self.progress.send(&self.upload_id, event);
    }

    /// Send the terminal event and close the channel.
    pub fn finish(&self, mut event: ProgressEvent) {
        if !self.is_attached() {
            self.progress.close(&self.upload_id, None);
            return;
        }
        self.clamp(&mut event);
        self.progress.close(&self.upload_id, Some(event));
    }

    pub fn task_sink(&self) -> Arc<dyn StageSink> {
        Arc::new(TaskSink { reporter: self.clone() })
    }

    pub fn add_sub_task(&self, name: &str, relative_path: &str) -> Option<String> {
        self.tasks.add_sub_task(&self.task_id, name, relative_path)
    }

    pub fn sub_task_sink(&self, sub_id: Option<String>, file_name: &str) -> Arc<dyn StageSink> {
        Arc::new(SubTaskSink {
            reporter: self.clone(),
            sub_id,
            file_name: file_name.to_string(),
        })
    }

    pub fn complete_sub_task(&self, sub_id: Option<&str>, file_name: &str, registered: &RegisteredFile) {
        let aggregate = sub_id.and_then(|id| self.tasks.complete_sub_task(&self.task_id, id, registered.clone()));
        let event = ProgressEvent::new(ProgressStatus::FileCompleted, aggregate.unwrap_or(0.0))
            .with_message(format!("Registered: {}", registered.path))
            .with_file_name(file_name)
            .with_registered(registered);
        self.emit(event);
    }

    pub fn fail_sub_task(&self, sub_id: Option<&str>, file_name: &str, error: &UploadError) {
        let aggregate = sub_id.and_then(|id| self.tasks.fail_sub_task(&self.task_id, id, error.to_string()));
        let event = ProgressEvent::new(ProgressStatus::FileFailed, aggregate.unwrap_or(0.0))
            .with_message(format!("Error processing {}", file_name))
            .with_file_name(file_name)
            .with_error(error.to_string());
        self.emit(event);
    }
}

struct TaskSink {
    reporter: TaskReporter,
}

impl StageSink for TaskSink {
    fn stage(&self, status: TaskStatus, event: ProgressEvent) {
        self.reporter
            .tasks
            .update_status(&self.reporter.task_id, status, Some(event.progress));
        self.reporter.emit(event);
    }
}

/// 子任务的阶段进度：记录子任务自身进度，通道上报父任务的平均进度
struct SubTaskSink {
    reporter: TaskReporter,
    sub_id: Option<String>,
    file_name: String,
}

impl StageSink for SubTaskSink {
    fn stage(&self, status: TaskStatus, mut event: ProgressEvent) {
        let aggregate = self.sub_id.as_deref().and_then(|id| {
            self.reporter
                .tasks
                .update_sub_task(&self.reporter.task_id, id, status, event.progress)
        });
        event.progress = aggregate.unwrap_or(0.0);
        if event.individual_file_name.is_none() {
            event.individual_file_name = Some(self.file_name.clone());
        }
        self.reporter.emit(event);
    }
}
