use std::time::Duration;

use rdkafka::{
    ClientConfig,
    error::KafkaError,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};

use crate::{Envelope, config::KafkaSettings, sink::LogHeaders, transport::Sender};

/// Log-stream backend writing to Kafka topics.
///
/// Records are keyed by [`KafkaRoute::key`] so every event of one enrollment
/// lands on the same partition. Only the partition leader acknowledges: the
/// log stream is observability data and the sink drops what it cannot write.
#[derive(Clone)]
pub struct Kafka {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl Kafka {
    /// Wrap an existing producer. Enqueueing gives up after 5 seconds.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            queue_timeout: Duration::from_secs(5),
        }
    }

    /// Producer for `settings.bootstrap_servers`.
    pub fn from_settings(settings: &KafkaSettings) -> Result<Self, KafkaError> {
        let message_timeout = settings.message_timeout.as_millis().to_string();
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("client.id", "mailchute")
            .set("acks", "1")
            .set("enable.idempotence", "false")
            .set("message.timeout.ms", &message_timeout)
            .set("request.timeout.ms", "3000")
            .set("socket.timeout.ms", "5000")
            .set("linger.ms", "5")
            .create::<FutureProducer>()?;

        Ok(Self::new(producer).with_queue_timeout(settings.message_timeout))
    }

    /// How long a send may wait for room in the producer queue.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl<H, M> Sender<H, M> for Kafka
where
    H: KafkaRoute + Send + Sync + 'static,
    M: AsRef<[u8]> + Send + Sync + 'static,
{
    type Error = KafkaError;

    #[tracing::instrument(skip_all, fields(topic = envelope.headers.topic()))]
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        let Envelope { headers, message } = envelope;

        let mut record = FutureRecord::to(headers.topic())
            .key(headers.key())
            .payload(message.as_ref());
        if let Some(event_type) = headers.event_type() {
            record = record.headers(OwnedHeaders::new().insert(Header {
                key: EVENT_TYPE_HEADER,
                value: Some(event_type),
            }));
        }

        self.producer
            .send(record, self.queue_timeout)
            .await
            .map_err(|(error, _)| error)?;
        Ok(())
    }
}

/// Kafka header naming the kind of a log record.
pub const EVENT_TYPE_HEADER: &str = "event-type";

/// Where a record goes on the log stream.
pub trait KafkaRoute {
    fn topic(&self) -> &str;

    /// Partition key.
    fn key(&self) -> &[u8];

    fn event_type(&self) -> Option<&str> {
        None
    }
}

impl KafkaRoute for LogHeaders {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn key(&self) -> &[u8] {
        self.key.as_bytes()
    }

    fn event_type(&self) -> Option<&str> {
        Some(&self.event_type)
    }
}
