//! Progress channel registry / 进度通道注册表
//!
//! Maps an upload id to one open push channel. Delivery is best-effort:
//! sending to an id without a channel is a silent no-op. A registration
//! ends when the channel is closed or when its receiver is dropped (observer
//! went away); neither affects the upload itself.

pub mod types;

pub use types::*;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;

struct Channel {
    generation: u64,
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

#[derive(Clone, Default)]
pub struct ProgressRegistry {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
    generations: Arc<AtomicU64>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the channel for `upload_id` / 打开通道，同一 ID 后注册者覆盖前者
    pub fn open(&self, upload_id: &str) -> ProgressReceiver {
        let (sender, rx) = mpsc::unbounded_channel();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .channels
            .write()
            .insert(upload_id.to_string(), Channel { generation, sender });
        if previous.is_some() {
            tracing::debug!("Progress channel {} replaced by a new observer", upload_id);
        } else {
            tracing::debug!("Progress channel {} opened", upload_id);
        }
        ProgressReceiver {
            rx,
            registry: self.clone(),
            upload_id: upload_id.to_string(),
            generation,
        }
    }

    /// Best-effort delivery, returns whether an observer received the event / 尽力投递
    pub fn send(&self, upload_id: &str, event: ProgressEvent) -> bool {
        let (generation, sender) = match self.channels.read().get(upload_id) {
            Some(channel) => (channel.generation, channel.sender.clone()),
            None => return false,
        };

        if sender.send(event).is_ok() {
            return true;
        }
        self.detach(upload_id, generation);
        false
    }

    /// Send an optional final event, then release the channel / 发送最终事件后关闭
    pub fn close(&self, upload_id: &str, final_event: Option<ProgressEvent>) -> bool {
        let channel = self.channels.write().remove(upload_id);
        match channel {
            Some(channel) => {
                if let Some(event) = final_event {
                    let _ = channel.sender.send(event);
                }
                tracing::debug!("Progress channel {} closed", upload_id);
                true
            }
            None => false,
        }
    }

    /// 观察者断开：仅当仍是同一个通道时移除注册
    fn detach(&self, upload_id: &str, generation: u64) {
        let mut channels = self.channels.write();
        if channels.get(upload_id).is_some_and(|current| current.generation == generation) {
            channels.remove(upload_id);
            tracing::debug!("Progress channel {} observer disconnected, removed", upload_id);
        }
    }

    pub fn is_open(&self, upload_id: &str) -> bool {
        self.channels.read().contains_key(upload_id)
    }

    /// Number of open channels / 当前打开的通道数
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

/// Receiving end of one progress channel. Dropping it unregisters the channel.
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    registry: ProgressRegistry,
    upload_id: String,
    generation: u64,
}

impl ProgressReceiver {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

impl Stream for ProgressReceiver {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ProgressEvent>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ProgressReceiver {
    fn drop(&mut self) {
        self.registry.detach(&self.upload_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(progress: f32) -> ProgressEvent {
        ProgressEvent::new(ProgressStatus::UploadingToStore, progress)
    }

    #[test]
    fn test_send_without_channel_is_noop() {
        let registry = ProgressRegistry::new();
        assert!(!registry.send("missing", event(10.0)));
        assert!(!registry.close("missing", None));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_then_final_event() {
        let registry = ProgressRegistry::new();
        let mut rx = registry.open("up-1");
        for p in [5.0, 10.0, 50.0] {
            assert!(registry.send("up-1", event(p)));
        }
        assert!(registry.close("up-1", Some(ProgressEvent::new(ProgressStatus::Completed, 100.0))));

        let mut received = Vec::new();
        while let Some(ev) = rx.recv().await {
            received.push(ev.progress);
        }
        assert_eq!(received, vec![5.0, 10.0, 50.0, 100.0]);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_second_open_replaces_first() {
        let registry = ProgressRegistry::new();
        let mut first = registry.open("up-1");
        let mut second = registry.open("up-1");
        assert_eq!(registry.len(), 1);

        registry.send("up-1", event(20.0));
        assert_eq!(second.recv().await.unwrap().progress, 20.0);
        // 旧通道的发送端已被丢弃
        assert!(first.recv().await.is_none());
    }

    #[test]
    fn test_disconnect_removes_registration() {
        let registry = ProgressRegistry::new();
        let rx = registry.open("up-1");
        assert!(registry.is_open("up-1"));
        drop(rx);
        assert!(!registry.is_open("up-1"));
        assert!(!registry.send("up-1", event(30.0)));
    }

    #[test]
    fn test_silent_observers_do_not_accumulate() {
        let registry = ProgressRegistry::new();
        for i in 0..100 {
            let rx = registry.open(&format!("up-{}", i));
            drop(rx);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_receiver_does_not_remove_new_channel() {
        let registry = ProgressRegistry::new();
        let stale = registry.open("up-1");
        let _fresh = registry.open("up-1");
        drop(stale);
        assert!(registry.is_open("up-1"));
        assert!(registry.send("up-1", event(40.0)));
    }

    #[tokio::test]
    async fn test_receiver_is_a_stream() {
        use futures::StreamExt;

        let registry = ProgressRegistry::new();
        let rx = registry.open("up-1");
        assert_eq!(rx.upload_id(), "up-1");
        registry.send("up-1", event(10.0));
        registry.close("up-1", Some(ProgressEvent::new(ProgressStatus::Failed, 0.0)));

        let statuses: Vec<ProgressStatus> = rx.map(|e| e.status).collect().await;
        assert_eq!(statuses, vec![ProgressStatus::UploadingToStore, ProgressStatus::Failed]);
        assert!(registry.is_empty());
    }
}
