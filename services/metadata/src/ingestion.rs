use crate::config::MessagingConfig;
use crate::messaging::{Disposition, InboundMessage, MessageHandler};
use crate::video_store::{MalformedId, StoreError, VideoId, VideoMetadata, VideoStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Event published when a video upload completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoUploadedEvent {
    pub video: UploadedVideo,
}

/// Video section of [`VideoUploadedEvent`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedVideo {
    /// Publisher-assigned id, used verbatim as the record id
    pub id: String,
    /// Display/file name
    pub name: String,
}

/// Why a payload could not be turned into a record
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Payload is not a video-uploaded event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event carries an invalid video id: {0}")]
    InvalidId(#[from] MalformedId),
}

impl VideoUploadedEvent {
    /// Decode a UTF-8 JSON payload
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(payload)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Record to persist, with id and name taken as-is from the event
    pub fn into_metadata(self) -> Result<VideoMetadata, ParseError> {
        Ok(VideoMetadata {
            id: VideoId::parse(&self.video.id)?,
            name: self.video.name,
        })
    }
}

/// Terminal state of one delivery
#[derive(Debug)]
pub enum IngestionOutcome {
    /// Record written
    Persisted(VideoMetadata),
    /// An equal record was already stored by an earlier delivery
    AlreadyPersisted(VideoMetadata),
    /// Payload could not be parsed
    ParseFailed(ParseError),
    /// Id already stored with different contents; the stored record wins
    Conflict {
        existing: VideoMetadata,
        incoming: VideoMetadata,
    },
    /// Storage rejected the write; `attempts` counts failed deliveries of this id
    PersistFailed {
        id: VideoId,
        error: StoreError,
        attempts: u32,
    },
}

/// Bounds on redelivery of events that fail on storage
#[derive(Debug, Clone, Copy)]
pub struct RedeliveryPolicy {
    /// Failed deliveries of one id before it is dead-lettered
    pub max_attempts: u32,
    /// Pause before a failed delivery is requeued
    pub retry_delay: Duration,
}

impl RedeliveryPolicy {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts.max(1),
            retry_delay: config.retry_delay(),
        }
    }
}

impl IngestionOutcome {
    /// How the delivery that produced this outcome is settled
    pub fn disposition(&self, policy: &RedeliveryPolicy) -> Disposition {
        match self {
            Self::Persisted(_) | Self::AlreadyPersisted(_) => Disposition::Ack,
            Self::ParseFailed(_) | Self::Conflict { .. } => Disposition::DeadLetter,
            Self::PersistFailed { attempts, .. } if *attempts >= policy.max_attempts => {
                Disposition::DeadLetter
            }
            Self::PersistFailed { .. } => Disposition::Requeue,
        }
    }
}

/// Failed-delivery counts per video id, held for the life of the process
#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    failures: Mutex<HashMap<VideoId, u32>>,
}

impl RedeliveryTracker {
    /// Count one more failure for `id` and return the total
    pub fn record_failure(&self, id: &VideoId) -> u32 {
        let mut failures = self.failures.lock();
        let count = failures.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&self, id: &VideoId) {
        self.failures.lock().remove(id);
    }

    pub fn failures(&self, id: &VideoId) -> u32 {
        self.failures.lock().get(id).copied().unwrap_or(0)
    }
}

/// Turns video-uploaded deliveries into stored records
pub struct IngestionHandler {
    store: Arc<dyn VideoStore>,
    policy: RedeliveryPolicy,
    tracker: RedeliveryTracker,
}

impl IngestionHandler {
    pub fn new(store: Arc<dyn VideoStore>, policy: RedeliveryPolicy) -> Self {
        Self {
            store,
            policy,
            tracker: RedeliveryTracker::default(),
        }
    }

    /// Parse and persist one payload
    pub async fn ingest(&self, payload: &[u8]) -> IngestionOutcome {
        let video = match VideoUploadedEvent::parse(payload).and_then(|e| e.into_metadata()) {
            Ok(video) => video,
            Err(e) => return IngestionOutcome::ParseFailed(e),
        };

        debug!(video_id = %video.id, name = %video.name, "Parsed video-uploaded event");

        match self.store.insert_video(&video).await {
            Ok(()) => {
                self.tracker.clear(&video.id);
                IngestionOutcome::Persisted(video)
            }
            Err(StoreError::DuplicateKey(_)) => self.resolve_duplicate(video).await,
            Err(error) => IngestionOutcome::PersistFailed {
                attempts: self.tracker.record_failure(&video.id),
                id: video.id,
                error,
            },
        }
    }

    /// The id is already stored: equal contents mean this is a redelivery
    async fn resolve_duplicate(&self, incoming: VideoMetadata) -> IngestionOutcome {
        match self.store.get_video(&incoming.id).await {
            Ok(Some(existing)) => {
                self.tracker.clear(&incoming.id);
                if existing == incoming {
                    IngestionOutcome::AlreadyPersisted(existing)
                } else {
                    IngestionOutcome::Conflict { existing, incoming }
                }
            }
            // Deleted between the insert and the lookup
            Ok(None) => {
                let id = incoming.id;
                IngestionOutcome::PersistFailed {
                    attempts: self.tracker.record_failure(&id),
                    error: StoreError::DuplicateKey(id.clone()),
                    id,
                }
            }
            Err(error) => IngestionOutcome::PersistFailed {
                attempts: self.tracker.record_failure(&incoming.id),
                id: incoming.id,
                error,
            },
        }
    }

    pub fn tracker(&self) -> &RedeliveryTracker {
        &self.tracker
    }
}

#[async_trait]
impl MessageHandler for IngestionHandler {
    #[instrument(skip(self, message), fields(delivery_tag = message.delivery_tag, redelivered = message.redelivered))]
    async fn handle(&self, message: &InboundMessage) -> Disposition {
        info!("Received a 'video-uploaded' message");

        let outcome = self.ingest(&message.payload).await;
        let disposition = outcome.disposition(&self.policy);

        match &outcome {
            IngestionOutcome::Persisted(video) => {
                info!(video_id = %video.id, "Video metadata stored, acknowledging message");
            }
            IngestionOutcome::AlreadyPersisted(video) => {
                info!(video_id = %video.id, "Video already stored, acknowledging redelivery");
            }
            IngestionOutcome::ParseFailed(e) => {
                error!(
                    error = %e,
                    payload_bytes = message.payload.len(),
                    "Malformed video-uploaded message, dead-lettering"
                );
            }
            IngestionOutcome::Conflict { existing, incoming } => {
                error!(
                    video_id = %incoming.id,
                    stored_name = %existing.name,
                    incoming_name = %incoming.name,
                    "Video id already stored with different metadata, dead-lettering"
                );
            }
            IngestionOutcome::PersistFailed {
                id,
                error,
                attempts,
            } => {
                if disposition == Disposition::DeadLetter {
                    error!(
                        video_id = %id,
                        error = %error,
                        attempts = attempts,
                        "Giving up on video after repeated storage failures, dead-lettering"
                    );
                    self.tracker.clear(id);
                } else {
                    warn!(
                        video_id = %id,
                        error = %error,
                        attempts = attempts,
                        max_attempts = self.policy.max_attempts,
                        "Failed to store video metadata, requeueing"
                    );
                }
            }
        }

        match disposition {
            Disposition::Ack => metrics::counter!("metadata.messages.acked").increment(1),
            Disposition::Requeue => {
                metrics::counter!("metadata.messages.requeued").increment(1);
                if !self.policy.retry_delay.is_zero() {
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
            }
            Disposition::DeadLetter => {
                metrics::counter!("metadata.messages.dead_lettered").increment(1)
            }
        }

        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryVideoStore;
    use crate::video_store::{MockVideoStore, PageRequest};

    fn policy(max_attempts: u32) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts,
            retry_delay: Duration::ZERO,
        }
    }

    fn message(payload: &str) -> InboundMessage {
        InboundMessage {
            payload: payload.as_bytes().to_vec(),
            delivery_tag: 1,
            redelivered: false,
            exchange: "video-uploaded".to_string(),
        }
    }

    fn video(id: &str, name: &str) -> VideoMetadata {
        VideoMetadata {
            id: VideoId::parse(id).unwrap(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_parse_video_uploaded_event() {
        let event =
            VideoUploadedEvent::parse(br#"{"video": {"id": "abc123", "name": "new.mp4"}}"#)
                .unwrap();
        assert_eq!(event.video.id, "abc123");
        assert_eq!(event.video.name, "new.mp4");

        assert_eq!(event.into_metadata().unwrap(), video("abc123", "new.mp4"));
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let event = VideoUploadedEvent::parse(
            br#"{"video": {"id": "abc123", "name": "new.mp4", "size": 10}, "source": "upload"}"#,
        );
        assert!(event.is_ok());
    }

    #[test]
    fn test_parse_failures_are_typed() {
        assert!(matches!(
            VideoUploadedEvent::parse(&[0xff, 0xfe]),
            Err(ParseError::Utf8(_))
        ));
        assert!(matches!(
            VideoUploadedEvent::parse(b"not json"),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            VideoUploadedEvent::parse(br#"{"video": {"name": "x.mp4"}}"#),
            Err(ParseError::Json(_))
        ));

        let event =
            VideoUploadedEvent::parse(br#"{"video": {"id": "has space", "name": "x.mp4"}}"#)
                .unwrap();
        assert!(matches!(
            event.into_metadata(),
            Err(ParseError::InvalidId(MalformedId::InvalidCharacter(' ')))
        ));
    }

    #[test]
    fn test_disposition_mapping() {
        let policy = policy(3);
        let failed = |attempts| IngestionOutcome::PersistFailed {
            id: VideoId::parse("a1").unwrap(),
            error: StoreError::Query(sqlx::Error::PoolTimedOut),
            attempts,
        };

        assert_eq!(
            IngestionOutcome::Persisted(video("a1", "v1.mp4")).disposition(&policy),
            Disposition::Ack
        );
        assert_eq!(failed(1).disposition(&policy), Disposition::Requeue);
        assert_eq!(failed(2).disposition(&policy), Disposition::Requeue);
        assert_eq!(failed(3).disposition(&policy), Disposition::DeadLetter);
    }

    #[tokio::test]
    async fn test_single_delivery_persists_and_acks_once() {
        let store = Arc::new(MemoryVideoStore::default());
        let handler = IngestionHandler::new(store.clone(), policy(3));

        let disposition = handler
            .handle(&message(r#"{"video": {"id": "X", "name": "Y"}}"#))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        let videos = store.list_videos(&PageRequest::all()).await.unwrap();
        assert_eq!(videos, vec![video("X", "Y")]);
    }

    #[tokio::test]
    async fn test_redelivery_of_persisted_event_is_idempotent() {
        let store = Arc::new(MemoryVideoStore::default());
        let handler = IngestionHandler::new(store.clone(), policy(3));
        let payload = r#"{"video": {"id": "X", "name": "Y"}}"#;

        assert_eq!(handler.handle(&message(payload)).await, Disposition::Ack);

        let mut redelivery = message(payload);
        redelivery.redelivered = true;
        assert!(matches!(
            handler.ingest(&redelivery.payload).await,
            IngestionOutcome::AlreadyPersisted(_)
        ));
        assert_eq!(handler.handle(&redelivery).await, Disposition::Ack);

        let videos = store.list_videos(&PageRequest::all()).await.unwrap();
        assert_eq!(videos, vec![video("X", "Y")]);
    }

    #[tokio::test]
    async fn test_conflicting_redelivery_keeps_stored_record() {
        let store = Arc::new(MemoryVideoStore::default());
        let handler = IngestionHandler::new(store.clone(), policy(3));

        handler
            .handle(&message(r#"{"video": {"id": "X", "name": "Y"}}"#))
            .await;
        let disposition = handler
            .handle(&message(r#"{"video": {"id": "X", "name": "Z"}}"#))
            .await;

        assert_eq!(disposition, Disposition::DeadLetter);
        let stored = store
            .get_video(&VideoId::parse("X").unwrap())
            .await
            .unwrap();
        assert_eq!(stored, Some(video("X", "Y")));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered_without_write() {
        let mut store = MockVideoStore::new();
        store.expect_insert_video().never();

        let handler = IngestionHandler::new(Arc::new(store), policy(3));

        for payload in ["{", r#"{"video": null}"#, r#"{"video": {"id": "", "name": "a"}}"#] {
            assert_eq!(
                handler.handle(&message(payload)).await,
                Disposition::DeadLetter
            );
        }
    }

    #[tokio::test]
    async fn test_storage_failures_requeue_until_limit() {
        let mut store = MockVideoStore::new();
        store
            .expect_insert_video()
            .times(3)
            .returning(|_| Err(StoreError::Query(sqlx::Error::PoolTimedOut)));

        let handler = IngestionHandler::new(Arc::new(store), policy(3));
        let payload = r#"{"video": {"id": "a1", "name": "v1.mp4"}}"#;
        let id = VideoId::parse("a1").unwrap();

        assert_eq!(handler.handle(&message(payload)).await, Disposition::Requeue);
        assert_eq!(handler.tracker().failures(&id), 1);
        assert_eq!(handler.handle(&message(payload)).await, Disposition::Requeue);
        assert_eq!(handler.handle(&message(payload)).await, Disposition::DeadLetter);
        assert_eq!(handler.tracker().failures(&id), 0);
    }

    #[tokio::test]
    async fn test_success_after_failure_resets_attempts() {
        let mut store = MockVideoStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_insert_video()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::Query(sqlx::Error::PoolTimedOut)));
        store
            .expect_insert_video()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let handler = IngestionHandler::new(Arc::new(store), policy(3));
        let payload = r#"{"video": {"id": "a1", "name": "v1.mp4"}}"#;

        assert_eq!(handler.handle(&message(payload)).await, Disposition::Requeue);
        assert_eq!(handler.handle(&message(payload)).await, Disposition::Ack);
        assert_eq!(
            handler.tracker().failures(&VideoId::parse("a1").unwrap()),
            0
        );
    }
}
