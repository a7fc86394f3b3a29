//! In-crate fakes for the collaborator seams (test builds only).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::UploadError;
use crate::metadata::{MetadataService, RegistrationResponse};
use crate::progress::ProgressEvent;
use crate::scheduler::{TaskOutcome, TaskReporter, TaskRunner, UploadJob};
use crate::storage::{
    FetchSource, ObjectStoreConnector, ObjectStoreSession, StoreCredentials, TransferHandle,
    TransferProgress, TransferProgressCallback,
};
use crate::task::{RegisteredFile, TaskManager, TaskStatus};
use crate::upload::StageSink;

#[derive(Default)]
pub struct FakeMetadata {
    credential_requests: AtomicUsize,
    registrations: AtomicUsize,
    omit_file_id: Mutex<HashSet<String>>,
}

impl FakeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// `add_file(name, ..)` answers without a fileId
    pub fn omit_file_id_for(&self, name: &str) {
        self.omit_file_id.lock().insert(name.to_string());
    }

    pub fn credential_requests(&self) -> usize {
        self.credential_requests.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataService for FakeMetadata {
    async fn store_credentials(&self) -> Result<StoreCredentials, UploadError> {
        let n = self.credential_requests.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StoreCredentials {
            access_key_id: "ak".to_string(),
            secret_access_key: "sk".to_string(),
            session_token: None,
            endpoint: None,
            bucket_name: "bucket".to_string(),
            object_key: format!("obj-{}", n),
        })
    }

    async fn add_file(&self, name: &str, _object_key: &str) -> Result<RegistrationResponse, UploadError> {
        let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.omit_file_id.lock().contains(name) {
            return Ok(RegistrationResponse::default());
        }
        Ok(RegistrationResponse {
            file_id: Some(format!("file-{}", n)),
            error_msg: None,
        })
    }
}

#[derive(Default)]
struct FakeStoreState {
    uploads: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

/// Object store that records transfers by source file name.
#[derive(Default)]
pub struct FakeStore {
    state: Arc<FakeStoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads_of(&self, file_name: &str) {
        self.state.failing.lock().insert(file_name.to_string());
    }

    pub fn uploaded_sources(&self) -> Vec<String> {
        self.state.uploads.lock().clone()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.state.fetched.lock().clone()
    }
}

impl ObjectStoreConnector for FakeStore {
    fn connect(&self, _credentials: &StoreCredentials) -> Result<Arc<dyn ObjectStoreSession>> {
        Ok(Arc::new(FakeSession { state: self.state.clone() }))
    }
}

struct FakeSession {
    state: Arc<FakeStoreState>,
}

#[async_trait]
impl ObjectStoreSession for FakeSession {
    async fn begin_multipart_upload(
        &self,
        _bucket: &str,
        _object: &str,
        source: &Path,
        _part_concurrency: usize,
        on_progress: TransferProgressCallback,
    ) -> Result<TransferHandle> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = tokio::fs::metadata(source)
            .await
            .map_err(|e| anyhow!("source {:?} missing: {}", source, e))?
            .len();

        if self.state.failing.lock().contains(&name) {
            return Ok(TransferHandle::spawn(async move {
                Err(anyhow!("simulated transfer failure for {}", name))
            }));
        }

        on_progress(TransferProgress::new(size / 2, size, Duration::from_millis(5)));
        on_progress(TransferProgress::new(size, size, Duration::from_millis(10)));
        self.state.uploads.lock().push(name);
        Ok(TransferHandle::spawn(async { Ok(()) }))
    }

    async fn fetch_object(&self, _bucket: &str, _object: &str, source: &FetchSource) -> Result<()> {
        self.state.fetched.lock().push(source.url.clone());
        Ok(())
    }

    async fn object_exists(&self, _bucket: &str, _object: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Sink recording every stage update.
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<(TaskStatus, ProgressEvent)>>,
}

impl RecordingSink {
    pub fn progress(&self) -> Vec<f32> {
        self.updates.lock().iter().map(|(_, e)| e.progress).collect()
    }

    pub fn last_status(&self) -> Option<TaskStatus> {
        self.updates.lock().last().map(|(s, _)| *s)
    }
}

impl StageSink for RecordingSink {
    fn stage(&self, status: TaskStatus, event: ProgressEvent) {
        self.updates.lock().push((status, event));
    }
}

/// Runner whose jobs finish only when the test releases them by name.
/// Jobs without a gate succeed immediately; a job named `panic` panics.
pub struct GatedRunner {
    gates: Mutex<HashMap<String, oneshot::Receiver<TaskOutcome>>>,
    started: mpsc::UnboundedSender<String>,
}

impl GatedRunner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (started, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { gates: Mutex::new(HashMap::new()), started }), rx)
    }

    pub fn gate(&self, name: &str) -> oneshot::Sender<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().insert(name.to_string(), rx);
        tx
    }
}

#[async_trait]
impl TaskRunner for GatedRunner {
    async fn run(&self, job: UploadJob, _reporter: TaskReporter) -> TaskOutcome {
        let _ = self.started.send(job.name.clone());
        if job.name == "panic" {
            panic!("runner blew up");
        }
        let gate = self.gates.lock().remove(&job.name);
        match gate {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| TaskOutcome::Failed(UploadError::Internal("gate dropped".to_string()))),
            None => TaskOutcome::Registered(RegisteredFile {
                id: format!("id-{}", job.name),
                path: job.name.clone(),
            }),
        }
    }
}

pub fn registered(name: &str) -> TaskOutcome {
    TaskOutcome::Registered(RegisteredFile { id: format!("id-{}", name), path: name.to_string() })
}

/// Wait until the task reaches a terminal state (or panic after 5s).
pub async fn wait_terminal(tasks: &TaskManager, task_id: &str) -> TaskStatus {
    for _ in 0..500 {
        if let Some(task) = tasks.get_task(task_id) {
            if task.status.is_terminal() {
                return task.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} did not finish", task_id);
}

pub async fn next_started(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a job to start")
        .expect("runner dropped")
}
