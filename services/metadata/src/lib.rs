//! Video Metadata Service
//!
//! Persists video metadata records and serves them over HTTP. Records are
//! ingested from `video-uploaded` events published on a RabbitMQ fanout
//! exchange and stored in PostgreSQL.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once ingestion**: a delivery is acknowledged only after its
//!   record is stored
//! - **Idempotent redelivery**: an event whose record already exists with the
//!   same contents is acknowledged without a second write
//! - **Bounded retries**: malformed payloads and events that keep failing on
//!   storage are routed to a dead-letter exchange instead of redelivering
//!   forever
//!
//! ## Architecture
//!
//! ```text
//! Publisher                 RabbitMQ                        PostgreSQL
//! ┌──────────────┐         ┌────────────────────┐          ┌──────────────┐
//! │ video upload │────────▶│ video-uploaded     │          │ videos       │
//! └──────────────┘         │ (fanout)           │          └──────────────┘
//!                          └────────────────────┘                 ▲  │
//!                                    │                            │  │
//!                                    ▼                            │  │
//!                          ┌────────────────────┐                 │  │
//!                          │ anonymous queue    │                 │  │
//!                          └────────────────────┘                 │  │
//!                                    │                            │  │
//!                                    ▼                            │  │
//!                          ┌────────────────────┐                 │  │
//!                          │ Ingestion Handler  │─────────────────┘  │
//!                          └────────────────────┘                    │
//!                                    │ nack                          ▼
//!                                    ▼                       ┌──────────────┐
//!                          ┌────────────────────┐            │ Query API    │
//!                          │ dead-letter queue  │            │ GET /videos  │
//!                          └────────────────────┘            │ GET /video   │
//!                                                            └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod ingestion;
pub mod lifecycle;
pub mod messaging;
pub mod video_store;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{AppState, ApiError, VideoListResponse, VideoResponse};
pub use config::Config;
pub use ingestion::{IngestionHandler, IngestionOutcome, ParseError, VideoUploadedEvent};
pub use lifecycle::{start, start_with, Backends, LifecycleState, RunningService, StartupError};
pub use messaging::{Disposition, EventBroker, MessagingError, MessagingGateway, Topology};
pub use video_store::{MalformedId, PageRequest, PgVideoStore, StoreError, VideoId, VideoMetadata, VideoStore};
