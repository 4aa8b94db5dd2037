use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    Envelope,
    broker::{Channel, Connector},
    connection::ConnectionManager,
    transport::Sender,
};

/// Sender publishing to a durable broker queue.
///
/// Each [`send`](Sender::send) asks the [`ConnectionManager`] for an open
/// channel, which reconnects if needed, then publishes once. A failed publish
/// is returned as is. Messages go through the default direct exchange with
/// the queue name as routing key and are marked persistent.
pub struct QueueSender<C: Connector> {
    manager: Arc<ConnectionManager<C>>,
}

impl<C: Connector> QueueSender<C> {
    pub fn new(manager: Arc<ConnectionManager<C>>) -> Self {
        Self { manager }
    }
}

impl<C: Connector> Clone for QueueSender<C> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[async_trait]
impl<C, H, M> Sender<H, M> for QueueSender<C>
where
    C: Connector,
    H: QueueRoute + Send + Sync + 'static,
    M: AsRef<[u8]> + Send + Sync + 'static,
{
    type Error = tower::BoxError;

    #[tracing::instrument(skip_all, fields(queue = envelope.headers.queue()))]
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        let channel = self.manager.ensure_open().await?;
        channel
            .publish(
                envelope.headers.queue(),
                envelope.message.as_ref(),
                envelope.headers.retry_count(),
            )
            .await?;
        tracing::debug!("Message published");
        Ok(())
    }
}

/// Destination of a queue message.
pub trait QueueRoute {
    /// Queue name, used as routing key on the default exchange.
    fn queue(&self) -> &str;

    /// Consumer-side retry count to stamp on the message.
    fn retry_count(&self) -> u32 {
        0
    }
}

/// Queue headers carrying an explicit retry count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHeaders {
    pub queue: String,
    pub retry_count: u32,
}

impl QueueHeaders {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

impl QueueRoute for QueueHeaders {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl QueueRoute for String {
    fn queue(&self) -> &str {
        self
    }
}

impl QueueRoute for &str {
    fn queue(&self) -> &str {
        self
    }
}
