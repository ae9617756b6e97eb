use crate::config::DatabaseConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Longest identifier accepted from publishers or HTTP callers
pub const MAX_VIDEO_ID_LEN: usize = 128;

/// Identifier assigned to a video by the upstream publisher.
///
/// Ids are never generated here. They enter the service only through
/// [`VideoId::parse`], so a value of this type is always structurally valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct VideoId(String);

/// Reasons an identifier is rejected at the boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedId {
    #[error("video id is empty")]
    Empty,

    #[error("video id is {len} characters long, at most {max} allowed", max = MAX_VIDEO_ID_LEN)]
    TooLong { len: usize },

    #[error("video id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

impl VideoId {
    /// Validate a raw identifier. Accepts ASCII letters, digits, `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self, MalformedId> {
        if raw.is_empty() {
            return Err(MalformedId::Empty);
        }
        let len = raw.chars().count();
        if len > MAX_VIDEO_ID_LEN {
            return Err(MalformedId::TooLong { len });
        }
        if let Some(ch) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(MalformedId::InvalidCharacter(ch));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VideoId {
    type Err = MalformedId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VideoId {
    type Error = MalformedId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored video metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct VideoMetadata {
    /// Publisher-assigned id, exposed as `_id` to HTTP clients
    #[serde(rename = "_id")]
    pub id: VideoId,
    /// Display/file name
    pub name: String,
}

/// Window over the video listing.
///
/// The HTTP API always asks for [`PageRequest::all`]; the offset and limit
/// are kept so paging can be added without changing the store contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Number of records to skip
    pub offset: u64,
    /// Maximum number of records, `None` for no bound
    pub limit: Option<u64>,
}

impl PageRequest {
    /// Every record, in the store's natural order
    pub fn all() -> Self {
        Self::default()
    }

    /// `LIMIT` bind value. Bounds past `i64::MAX` are as good as none.
    fn sql_limit(&self) -> Option<i64> {
        self.limit.and_then(|limit| i64::try_from(limit).ok())
    }

    /// `OFFSET` bind value, saturated to the largest offset PostgreSQL accepts
    fn sql_offset(&self) -> i64 {
        i64::try_from(self.offset).unwrap_or(i64::MAX)
    }
}

/// Errors raised by the storage gateway
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to database: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("Video {0} already exists")]
    DuplicateKey(VideoId),

    #[error("Database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Record primitives over the `videos` collection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoStore: Send + Sync {
    /// All videos within `page`, unordered
    async fn list_videos(&self, page: &PageRequest) -> Result<Vec<VideoMetadata>, StoreError>;

    /// Look up one video, `None` when absent
    async fn get_video(&self, id: &VideoId) -> Result<Option<VideoMetadata>, StoreError>;

    /// Insert a new video. An existing id yields [`StoreError::DuplicateKey`]
    /// and leaves the stored record untouched.
    async fn insert_video(&self, video: &VideoMetadata) -> Result<(), StoreError>;

    /// Round-trip to the backing store
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}

/// PostgreSQL-backed video store
pub struct PgVideoStore {
    pool: PgPool,
}

impl PgVideoStore {
    /// Connect to `config.host` and select database `config.name`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(&config.host)
            .map_err(StoreError::Connection)?
            .database(&config.name);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(options)
            .await
            .map_err(StoreError::Connection)?;

        info!(database = %config.name, "Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    #[instrument(skip(self))]
    async fn list_videos(&self, page: &PageRequest) -> Result<Vec<VideoMetadata>, StoreError> {
        let videos = sqlx::query_as::<_, VideoMetadata>(
            r#"
            SELECT id, name
            FROM videos
            LIMIT $1
            OFFSET $2
            "#,
        )
        .bind(page.sql_limit())
        .bind(page.sql_offset())
        .fetch_all(&self.pool)
        .await?;

        debug!(count = videos.len(), "Listed videos");

        Ok(videos)
    }

    #[instrument(skip(self), fields(video_id = %id))]
    async fn get_video(&self, id: &VideoId) -> Result<Option<VideoMetadata>, StoreError> {
        let video = sqlx::query_as::<_, VideoMetadata>(
            r#"
            SELECT id, name
            FROM videos
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(video)
    }

    #[instrument(skip(self, video), fields(video_id = %video.id))]
    async fn insert_video(&self, video: &VideoMetadata) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO videos (id, name)
            VALUES ($1, $2)
            "#,
        )
        .bind(&video.id)
        .bind(&video.name)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(name = %video.name, "Video inserted");
                metrics::counter!("metadata.videos.inserted").increment(1);
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateKey(video.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("Closed PostgreSQL connection pool");
        }
    }
}
