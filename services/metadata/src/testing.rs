//! In-process stand-ins for PostgreSQL and RabbitMQ used by unit tests.

use crate::messaging::{
    ConsumerHandle, Disposition, EventBroker, InboundMessage, MessageHandler, MessagingError,
    Topology,
};
use crate::video_store::{PageRequest, StoreError, VideoId, VideoMetadata, VideoStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Map-backed store with the same duplicate-key behaviour as the `videos` table
#[derive(Default)]
pub struct MemoryVideoStore {
    videos: Mutex<HashMap<VideoId, VideoMetadata>>,
    closed: AtomicBool,
}

impl MemoryVideoStore {
    pub fn with_videos(videos: Vec<VideoMetadata>) -> Self {
        let store = Self::default();
        {
            let mut map = store.videos.lock();
            for video in videos {
                map.insert(video.id.clone(), video);
            }
        }
        store
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoStore for MemoryVideoStore {
    async fn list_videos(&self, page: &PageRequest) -> Result<Vec<VideoMetadata>, StoreError> {
        let videos = self.videos.lock();
        let iter = videos.values().skip(page.offset as usize).cloned();
        Ok(match page.limit {
            Some(limit) => iter.take(limit as usize).collect(),
            None => iter.collect(),
        })
    }

    async fn get_video(&self, id: &VideoId) -> Result<Option<VideoMetadata>, StoreError> {
        Ok(self.videos.lock().get(id).cloned())
    }

    async fn insert_video(&self, video: &VideoMetadata) -> Result<(), StoreError> {
        let mut videos = self.videos.lock();
        if videos.contains_key(&video.id) {
            return Err(StoreError::DuplicateKey(video.id.clone()));
        }
        videos.insert(video.id.clone(), video.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Query(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Broker that delivers published payloads to the consumer in-process and
/// records how each one was settled
pub struct FakeBroker {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    settled: Arc<Mutex<Vec<Disposition>>>,
    declared: Mutex<Option<Topology>>,
    fail_topology: bool,
    closed: AtomicBool,
}

impl FakeBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            settled: Arc::new(Mutex::new(Vec::new())),
            declared: Mutex::new(None),
            fail_topology: false,
            closed: AtomicBool::new(false),
        }
    }

    pub fn failing_topology() -> Self {
        Self {
            fail_topology: true,
            ..Self::new()
        }
    }

    /// Publish to the bound exchange
    pub fn publish(&self, payload: &str) {
        let _ = self.sender.send(payload.as_bytes().to_vec());
    }

    pub fn settled(&self) -> Vec<Disposition> {
        self.settled.lock().clone()
    }

    pub fn declared(&self) -> Option<Topology> {
        self.declared.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventBroker for FakeBroker {
    async fn declare_topology(&self, topology: &Topology) -> Result<String, MessagingError> {
        if self.fail_topology {
            return Err(MessagingError::Topology("exchange refused".to_string()));
        }
        *self.declared.lock() = Some(topology.clone());
        Ok("amq.gen-test".to_string())
    }

    async fn start_consuming(
        &self,
        _queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle, MessagingError> {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| MessagingError::Consume("already consuming".to_string()))?;
        let settled = self.settled.clone();
        let tags = AtomicU64::new(0);

        Ok(ConsumerHandle::spawn(move |stop, lost| async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    payload = receiver.recv() => {
                        let Some(payload) = payload else {
                            lost.cancel();
                            break;
                        };
                        let message = InboundMessage {
                            payload,
                            delivery_tag: tags.fetch_add(1, Ordering::SeqCst) + 1,
                            redelivered: false,
                            exchange: "video-uploaded".to_string(),
                        };
                        let disposition = handler.handle(&message).await;
                        settled.lock().push(disposition);
                    }
                }
            }
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds, yielding to the runtime in between
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
