//! Startup and shutdown sequencing.
//!
//! Startup is strictly ordered: storage, then messaging and topology (after
//! which ingestion is already running), then the HTTP listener. A failure at
//! any stage releases everything acquired before it and only then returns
//! the error. Shutdown runs in reverse.

use crate::api::{self, AppState};
use crate::config::{Config, DatabaseConfig, MessagingConfig};
use crate::ingestion::{IngestionHandler, RedeliveryPolicy};
use crate::messaging::{ConsumerHandle, EventBroker, MessagingError, MessagingGateway, Topology};
use crate::video_store::{PgVideoStore, StoreError, VideoStore};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle stages, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    ConnectingStorage,
    ConnectingMessaging,
    DeclaringTopology,
    BindingListener,
    Running,
    ShuttingDown,
    Stopped,
}

/// Startup failures, by stage
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Storage unavailable: {0}")]
    Storage(#[from] StoreError),

    #[error("Messaging unavailable: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opens the external connections the service runs on
#[async_trait]
pub trait Backends: Send + Sync {
    async fn connect_store(
        &self,
        config: &DatabaseConfig,
    ) -> Result<Arc<dyn VideoStore>, StoreError>;

    async fn connect_broker(
        &self,
        config: &MessagingConfig,
    ) -> Result<Arc<dyn EventBroker>, MessagingError>;
}

/// PostgreSQL and RabbitMQ
pub struct LiveBackends;

#[async_trait]
impl Backends for LiveBackends {
    async fn connect_store(
        &self,
        config: &DatabaseConfig,
    ) -> Result<Arc<dyn VideoStore>, StoreError> {
        let store = PgVideoStore::connect(config).await?;

        if config.run_migrations {
            if let Err(e) = store.run_migrations().await {
                store.close().await;
                return Err(e);
            }
        }

        Ok(Arc::new(store))
    }

    async fn connect_broker(
        &self,
        config: &MessagingConfig,
    ) -> Result<Arc<dyn EventBroker>, MessagingError> {
        Ok(Arc::new(MessagingGateway::connect(config).await?))
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self { state }
    }

    fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn enter(&self, next: LifecycleState) {
        info!(from = ?self.current(), to = ?next, "Lifecycle transition");
        self.state.send_replace(next);
    }
}

/// Broker connection plus the consumer reading from it
struct ActiveMessaging {
    broker: Arc<dyn EventBroker>,
    consumer: ConsumerHandle,
    queue: String,
}

impl ActiveMessaging {
    async fn shutdown(self) {
        self.consumer.stop().await;
        self.broker.close().await;
        info!(queue = %self.queue, "Stopped event consumption");
    }
}

/// A fully started service
pub struct RunningService {
    lifecycle: Lifecycle,
    store: Arc<dyn VideoStore>,
    messaging: Option<ActiveMessaging>,
    server: JoinHandle<std::io::Result<()>>,
    stop_serving: CancellationToken,
    local_addr: Option<SocketAddr>,
}

/// Start the service with the live PostgreSQL and RabbitMQ backends
pub async fn start(config: &Config) -> Result<RunningService, StartupError> {
    start_with(config, &LiveBackends).await
}

/// Start the service on `backends`
pub async fn start_with<B>(config: &Config, backends: &B) -> Result<RunningService, StartupError>
where
    B: Backends + ?Sized,
{
    let lifecycle = Lifecycle::new();

    lifecycle.enter(LifecycleState::ConnectingStorage);
    let store = backends.connect_store(&config.database).await?;

    let messaging = if config.messaging.enabled {
        match start_messaging(&lifecycle, config, backends, store.clone()).await {
            Ok(messaging) => Some(messaging),
            Err(e) => {
                store.close().await;
                return Err(e);
            }
        }
    } else {
        warn!("Messaging disabled, video-uploaded events will not be ingested");
        None
    };

    lifecycle.enter(LifecycleState::BindingListener);
    let listener = match api::bind_listener(&config.api).await {
        Ok(listener) => listener,
        Err(source) => {
            if let Some(messaging) = messaging {
                messaging.shutdown().await;
            }
            store.close().await;
            return Err(StartupError::Bind {
                addr: format!("{}:{}", config.api.host, config.api.port),
                source,
            });
        }
    };
    let local_addr = listener.local_addr().ok();

    let stop_serving = CancellationToken::new();
    let router = api::create_router(AppState {
        store: store.clone(),
    });
    let token = stop_serving.clone();
    let server = tokio::spawn(api::serve(listener, router, async move {
        token.cancelled().await
    }));

    lifecycle.enter(LifecycleState::Running);

    Ok(RunningService {
        lifecycle,
        store,
        messaging,
        server,
        stop_serving,
        local_addr,
    })
}

/// Connect, declare topology and start consuming. Consumption begins here,
/// before the HTTP listener exists.
async fn start_messaging<B>(
    lifecycle: &Lifecycle,
    config: &Config,
    backends: &B,
    store: Arc<dyn VideoStore>,
) -> Result<ActiveMessaging, StartupError>
where
    B: Backends + ?Sized,
{
    lifecycle.enter(LifecycleState::ConnectingMessaging);
    let broker = backends.connect_broker(&config.messaging).await?;

    lifecycle.enter(LifecycleState::DeclaringTopology);
    let topology = Topology::from_config(&config.messaging);
    let handler = Arc::new(IngestionHandler::new(
        store,
        RedeliveryPolicy::from_config(&config.messaging),
    ));

    let started = async {
        let queue = broker.declare_topology(&topology).await?;
        let consumer = broker.start_consuming(&queue, handler).await?;
        Ok::<_, MessagingError>((queue, consumer))
    }
    .await;

    match started {
        Ok((queue, consumer)) => Ok(ActiveMessaging {
            broker,
            consumer,
            queue,
        }),
        Err(e) => {
            broker.close().await;
            Err(e.into())
        }
    }
}

impl RunningService {
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    /// Follow state changes, including `ShuttingDown` and `Stopped` which are
    /// entered after [`RunningService::shutdown`] has taken ownership
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.state.subscribe()
    }

    /// Address the HTTP listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Resolves if the broker connection drops. Never resolves when messaging
    /// is disabled. There is no reconnect; callers are expected to shut down.
    pub async fn broker_lost(&self) {
        match self.messaging {
            Some(ref messaging) => messaging.consumer.connection_lost().await,
            None => std::future::pending().await,
        }
    }

    /// Stop accepting connections, drain in-flight requests, stop consuming,
    /// close the broker and finally the store
    pub async fn shutdown(mut self) -> std::io::Result<()> {
        self.lifecycle.enter(LifecycleState::ShuttingDown);

        self.stop_serving.cancel();
        let served = match (&mut self.server).await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        };
        if let Err(ref e) = served {
            error!(error = %e, "HTTP server error");
        }

        if let Some(messaging) = self.messaging.take() {
            messaging.shutdown().await;
        }

        self.store.close().await;
        self.lifecycle.enter(LifecycleState::Stopped);

        served
    }
}
