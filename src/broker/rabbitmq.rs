use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_core::stream::BoxStream;
use lapin::{
    BasicProperties, Connection, ConnectionProperties,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;

use crate::{
    broker::{Channel, Connector, Delivery, RETRY_COUNT_HEADER, Role},
    config::RabbitMqSettings,
};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// RabbitMQ connector.
///
/// Each [`connect`](Connector::connect) opens a dedicated AMQP connection with
/// a single channel in publisher-confirm mode. Consume-role channels get a
/// prefetch of one so deliveries are processed strictly one at a time.
#[derive(Debug, Clone)]
pub struct RabbitMq {
    uri: String,
}

impl RabbitMq {
    /// Connector for an `amqp://` URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn from_settings(settings: &RabbitMqSettings) -> Self {
        Self::new(settings.uri())
    }
}

#[async_trait::async_trait]
impl Connector for RabbitMq {
    type Channel = RabbitMqChannel;

    #[tracing::instrument(skip(self))]
    async fn connect(&self, role: Role) -> Result<Self::Channel, tower::BoxError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;

        let open = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&open);
        connection.on_error(move |error| {
            tracing::warn!(%error, "RabbitMQ connection lost");
            flag.store(false, Ordering::Release);
        });

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        if role == Role::Consume {
            channel.basic_qos(1, BasicQosOptions::default()).await?;
        }

        Ok(RabbitMqChannel {
            connection: Arc::new(connection),
            channel: Arc::new(Mutex::new(channel)),
            open,
        })
    }
}

/// Channel and owning connection opened by [`RabbitMq`].
///
/// The `lapin::Channel` sits behind a mutex because it is not `Sync`.
#[derive(Clone)]
pub struct RabbitMqChannel {
    connection: Arc<Connection>,
    channel: Arc<Mutex<lapin::Channel>>,
    open: Arc<AtomicBool>,
}

impl RabbitMqChannel {
    fn track<T>(&self, result: Result<T, lapin::Error>) -> Result<T, tower::BoxError> {
        result.map_err(|error| {
            self.open.store(false, Ordering::Release);
            error.into()
        })
    }
}

#[async_trait::async_trait]
impl Channel for RabbitMqChannel {
    type Delivery = RabbitMqDelivery;

    fn is_open(&self) -> bool {
        let channel_open = self
            .channel
            .try_lock()
            .map(|channel| channel.status().connected())
            .unwrap_or(true);

        self.open.load(Ordering::Acquire) && self.connection.status().connected() && channel_open
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), tower::BoxError> {
        let channel = self.channel.lock().await;
        let result = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        self.track(result)?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        retry_count: u32,
    ) -> Result<(), tower::BoxError> {
        let mut headers = FieldTable::default();
        if retry_count > 0 {
            headers.insert(
                ShortString::from(RETRY_COUNT_HEADER),
                AMQPValue::LongUInt(retry_count),
            );
        }
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers);

        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await;
        let confirmation = self.track(confirm)?.await;
        if self.track(confirmation)?.is_nack() {
            return Err(format!("broker rejected message for queue {queue}").into());
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<Self::Delivery, tower::BoxError>>, tower::BoxError> {
        let channel = self.channel.lock().await;
        let result = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await;
        let consumer = self.track(result)?;

        let open = Arc::clone(&self.open);
        let deliveries = consumer.map(move |delivery| match delivery {
            Ok(delivery) => Ok(RabbitMqDelivery::from(delivery)),
            Err(error) => {
                open.store(false, Ordering::Release);
                Err(error.into())
            }
        });

        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<(), tower::BoxError> {
        self.open.store(false, Ordering::Release);

        let channel = self.channel.lock().await;
        if channel.status().connected() {
            if let Err(error) = channel.close(200, "closing").await {
                tracing::debug!(%error, "Channel already closed");
            }
        }
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await?;
        }

        Ok(())
    }
}

/// Delivery received from a [`RabbitMqChannel`].
pub struct RabbitMqDelivery {
    data: Vec<u8>,
    redelivered: bool,
    retry_count: u32,
    acker: Acker,
}

impl From<lapin::message::Delivery> for RabbitMqDelivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let retry_count = read_retry_count(delivery.properties.headers().as_ref());
        Self {
            data: delivery.data,
            redelivered: delivery.redelivered,
            retry_count,
            acker: delivery.acker,
        }
    }
}

fn read_retry_count(headers: Option<&FieldTable>) -> u32 {
    let Some(value) = headers.and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == RETRY_COUNT_HEADER)
            .map(|(_, value)| value)
    }) else {
        return 0;
    };

    match value {
        AMQPValue::LongUInt(n) => *n,
        AMQPValue::ShortUInt(n) => u32::from(*n),
        AMQPValue::LongInt(n) => u32::try_from(*n).unwrap_or(0),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).unwrap_or(0),
        _ => 0,
    }
}

#[async_trait::async_trait]
impl Delivery for RabbitMqDelivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    async fn ack(&self) -> Result<(), tower::BoxError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), tower::BoxError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
