//! AMQP messaging gateway.
//!
//! Owns the broker connection and its single channel, declares the
//! `video-uploaded` topology and drives a consumer task that hands each
//! delivery to a [`MessageHandler`] and settles it according to the returned
//! [`Disposition`].

use crate::config::MessagingConfig;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors raised by the messaging gateway
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Failed to connect to broker: {0}")]
    Connection(String),

    #[error("Failed to declare topology: {0}")]
    Topology(String),

    #[error("Failed to start consumer: {0}")]
    Consume(String),

    #[error("Failed to settle delivery {delivery_tag}: {reason}")]
    Settle { delivery_tag: u64, reason: String },
}

/// What to do with a delivery once the handler is finished with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; the broker may discard it
    Ack,
    /// Hand back to the broker for redelivery
    Requeue,
    /// Reject without requeue; routed to the dead-letter exchange if one is bound
    DeadLetter,
}

/// A delivery as seen by handlers, detached from the broker client
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Raw message body
    pub payload: Vec<u8>,
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    /// Set by the broker when this message was delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
}

impl From<&Delivery> for InboundMessage {
    fn from(delivery: &Delivery) -> Self {
        Self {
            payload: delivery.data.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_string(),
        }
    }
}

/// Handler trait for processing deliveries
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery and decide how it is settled
    async fn handle(&self, message: &InboundMessage) -> Disposition;
}

/// Exchange/queue layout the service consumes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Fanout exchange carrying upload events
    pub exchange: String,
    /// Durable fanout exchange (and same-named queue) for rejected messages
    pub dead_letter_exchange: Option<String>,
}

impl Topology {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            dead_letter_exchange: config.dead_letter_exchange().map(str::to_string),
        }
    }

    /// Arguments for the anonymous consumer queue
    fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(ref dlx) = self.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        arguments
    }
}

/// Running consumer task
pub struct ConsumerHandle {
    stop: CancellationToken,
    lost: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Spawn `run` with a stop token it must honour and a token it cancels
    /// when the broker connection goes away.
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let task = tokio::spawn(run(stop.clone(), lost.clone()));
        Self { stop, lost, task }
    }

    /// Resolves once the consumer has lost its broker connection
    pub async fn connection_lost(&self) {
        self.lost.cancelled().await
    }

    /// Stop consuming and wait for the in-flight delivery to settle
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Consumer task ended abnormally");
        }
    }
}

/// Broker operations the lifecycle depends on
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Declare exchanges and the anonymous queue; returns the queue name
    async fn declare_topology(&self, topology: &Topology) -> Result<String, MessagingError>;

    /// Start delivering messages from `queue` to `handler`, one at a time
    async fn start_consuming(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle, MessagingError>;

    /// Close channel and connection. Safe to call more than once.
    async fn close(&self);
}

/// Connection settings that run lapin's I/O and background work on the
/// calling tokio runtime. Must be called from within that runtime.
pub fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

/// RabbitMQ-backed gateway
pub struct MessagingGateway {
    connection: Connection,
    channel: Channel,
    consumer_tag_prefix: String,
}

impl MessagingGateway {
    /// Connect to the broker and open the channel used for everything else
    pub async fn connect(config: &MessagingConfig) -> Result<Self, MessagingError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| MessagingError::Connection("no broker URL configured".to_string()))?;

        let connection = Connection::connect(url, connection_properties())
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(200, "channel setup failed").await;
                return Err(MessagingError::Connection(e.to_string()));
            }
        };

        info!(channel_id = channel.id(), "Connected to message broker");

        Ok(Self {
            connection,
            channel,
            consumer_tag_prefix: config.consumer_tag_prefix.clone(),
        })
    }

    /// Declare a durable fanout exchange. Redeclaring it is a no-op.
    pub async fn declare_exchange(&self, name: &str) -> Result<(), MessagingError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(format!("exchange {name}: {e}")))
    }

    /// Declare a broker-named queue, exclusive to this connection and deleted with it
    pub async fn create_anonymous_queue(
        &self,
        arguments: FieldTable,
    ) -> Result<String, MessagingError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| MessagingError::Topology(format!("anonymous queue: {e}")))?;

        Ok(queue.name().as_str().to_string())
    }

    /// Bind `queue` to `exchange`. The routing key is ignored by fanout exchanges.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(format!("bind {queue} to {exchange}: {e}")))
    }

    /// Durable dead-letter exchange plus a durable queue of the same name, so
    /// rejected messages are kept for inspection.
    async fn declare_dead_letter(&self, dlx: &str) -> Result<(), MessagingError> {
        self.declare_exchange(dlx).await?;

        self.channel
            .queue_declare(
                dlx,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(format!("dead-letter queue {dlx}: {e}")))?;

        self.bind_queue(dlx, dlx, "").await
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, MessagingError> {
        let consumer_tag = format!("{}-{}", self.consumer_tag_prefix, Uuid::new_v4());

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume(e.to_string()))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Consuming from queue");

        Ok(consumer)
    }
}

#[async_trait]
impl EventBroker for MessagingGateway {
    #[instrument(skip(self))]
    async fn declare_topology(&self, topology: &Topology) -> Result<String, MessagingError> {
        if let Some(ref dlx) = topology.dead_letter_exchange {
            self.declare_dead_letter(dlx).await?;
        }

        self.declare_exchange(&topology.exchange).await?;
        let queue = self.create_anonymous_queue(topology.queue_arguments()).await?;
        self.bind_queue(&queue, &topology.exchange, "").await?;

        info!(
            exchange = %topology.exchange,
            queue = %queue,
            dead_letter_exchange = ?topology.dead_letter_exchange,
            "Declared messaging topology"
        );

        Ok(queue)
    }

    async fn start_consuming(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle, MessagingError> {
        let consumer = self.consume(queue).await?;
        Ok(ConsumerHandle::spawn(move |stop, lost| {
            consume_loop(consumer, handler, stop, lost)
        }))
    }

    async fn close(&self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "shutting down").await {
                warn!(error = %e, "Failed to close broker channel");
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "shutting down").await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }
        info!("Closed message broker connection");
    }
}

/// Pull deliveries in broker order and settle each before taking the next
async fn consume_loop(
    mut consumer: Consumer,
    handler: Arc<dyn MessageHandler>,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    info!("Starting message consumption loop");

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!("Received shutdown signal");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let message = InboundMessage::from(&delivery);

                        debug!(
                            delivery_tag = message.delivery_tag,
                            redelivered = message.redelivered,
                            "Received message"
                        );

                        let disposition = handler.handle(&message).await;
                        if let Err(e) = settle(&delivery, disposition).await {
                            error!(error = %e, "Failed to settle delivery");
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Broker connection lost");
                        lost.cancel();
                        break;
                    }
                    None => {
                        warn!("Delivery stream ended");
                        lost.cancel();
                        break;
                    }
                }
            }
        }
    }
}

async fn settle(delivery: &Delivery, disposition: Disposition) -> Result<(), MessagingError> {
    let result = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
        }
        Disposition::DeadLetter => {
            delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
        }
    };

    result.map_err(|e| MessagingError::Settle {
        delivery_tag: delivery.delivery_tag,
        reason: e.to_string(),
    })
}
