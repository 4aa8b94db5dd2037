//! Broker seam: connections, channels and deliveries.
//!
//! The [`ConnectionManager`](crate::connection::ConnectionManager) opens
//! channels through a [`Connector`]; the publisher and the consumer talk to
//! the broker exclusively through the returned [`Channel`].
//!
//! Backends:
//!
//! - [`inmemory`]: process-local broker with durable queues, manual
//!   acknowledgement and redelivery, used for tests and local pipelines
//! - [`rabbitmq`]: RabbitMQ through `lapin` (feature `rabbitmq`)

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use futures_core::stream::BoxStream;

pub use inmemory::InMemoryBroker;

/// Header carrying the consumer-side retry count of a republished message.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// What a connection is used for. Each role owns its own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publish,
    Consume,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Publish => f.write_str("publish"),
            Role::Consume => f.write_str("consume"),
        }
    }
}

/// Opens a connection and a channel on it.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    async fn connect(&self, role: Role) -> Result<Self::Channel, tower::BoxError>;
}

/// A live channel on a broker connection.
///
/// Closing a channel releases its connection too; a channel is never shared
/// across roles.
#[async_trait::async_trait]
pub trait Channel: Clone + Send + Sync + 'static {
    type Delivery: Delivery;

    /// Whether both the channel and its connection are still usable.
    fn is_open(&self) -> bool;

    /// Declare a durable queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, queue: &str) -> Result<(), tower::BoxError>;

    /// Publish a persistent message to `queue` through the default exchange.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        retry_count: u32,
    ) -> Result<(), tower::BoxError>;

    /// Subscribe to `queue` with manual acknowledgement, one unacknowledged
    /// delivery at a time.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<Self::Delivery, tower::BoxError>>, tower::BoxError>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<(), tower::BoxError>;
}

/// A message handed to a consumer and awaiting settlement.
#[async_trait::async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn payload(&self) -> &[u8];

    /// Set by the broker when the message was delivered before.
    fn redelivered(&self) -> bool;

    /// Value of the [`RETRY_COUNT_HEADER`], `0` when absent.
    fn retry_count(&self) -> u32;

    /// Positive acknowledgement: the broker forgets the message.
    async fn ack(&self) -> Result<(), tower::BoxError>;

    /// Negative acknowledgement, optionally asking for redelivery.
    async fn nack(&self, requeue: bool) -> Result<(), tower::BoxError>;
}
