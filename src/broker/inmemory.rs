use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_stream::stream;
use futures_core::stream::BoxStream;
use tokio::sync::{Mutex, Notify};

use crate::broker::{Channel, Connector, Delivery, Role};

/// Process-local broker for testing or local pipelines.
///
/// Queues behave like durable RabbitMQ queues consumed with manual
/// acknowledgement and a prefetch of one:
///
/// - published messages stay in the queue until a consumer acks them
/// - a nack with requeue, or a channel closing with deliveries still
///   unacknowledged, puts the message back at the head of the queue and
///   flags it as redelivered
/// - [`set_reachable(false)`](InMemoryBroker::set_reachable) simulates an
///   outage: every open channel is closed and new connections are refused
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    next_channel_id: u64,
    next_tag: u64,
    connections_opened: usize,
    connection_attempts: usize,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    retry_count: u32,
    redelivered: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the broker up or down.
    pub async fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock().await;
        state.unreachable = !reachable;
        if !reachable {
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                state.close_channel(id);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Messages held by `queue`, ready or awaiting acknowledgement.
    pub async fn depth(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    /// Payloads of the ready messages of `queue`, head first.
    pub async fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Push raw bytes onto `queue`, declaring it if needed.
    pub async fn inject(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .ready
            .push_back(StoredMessage {
                payload: payload.into(),
                retry_count: 0,
                redelivered: false,
            });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Total connections accepted since creation.
    pub async fn connections_opened(&self) -> usize {
        self.state.lock().await.connections_opened
    }

    /// Connection attempts since creation, refused ones included.
    pub async fn connection_attempts(&self) -> usize {
        self.state.lock().await.connection_attempts
    }

    /// Channels currently open.
    pub async fn open_channels(&self) -> usize {
        let state = self.state.lock().await;
        state
            .channels
            .values()
            .filter(|open| open.load(Ordering::Acquire))
            .count()
    }

    async fn take_next(&self, queue: &str, channel: u64) -> Option<InMemoryDelivery> {
        let mut state = self.state.lock().await;
        let tag = state.next_tag + 1;
        let q = state.queues.get_mut(queue)?;

        if q.unacked.values().any(|(owner, _)| *owner == channel) {
            return None;
        }
        let message = q.ready.pop_front()?;
        q.unacked.insert(tag, (channel, message.clone()));
        state.next_tag = tag;

        Some(InMemoryDelivery {
            broker: self.clone(),
            queue: queue.to_owned(),
            tag,
            message,
        })
    }

    async fn settle(&self, queue: &str, tag: u64, requeue: Option<bool>) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "queue not found"))?;
        let (_, mut message) = q.unacked.remove(&tag).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "unknown delivery tag")
        })?;

        if requeue == Some(true) {
            message.redelivered = true;
            q.ready.push_front(message);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

impl BrokerState {
    fn close_channel(&mut self, id: u64) {
        let Some(open) = self.channels.remove(&id) else {
            return;
        };
        open.store(false, Ordering::Release);

        for queue in self.queues.values_mut() {
            let mut orphaned: Vec<(u64, StoredMessage)> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == id)
                .map(|(tag, (_, message))| (*tag, message.clone()))
                .collect();
            orphaned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

            for (tag, mut message) in orphaned {
                queue.unacked.remove(&tag);
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }
}

#[async_trait::async_trait]
impl Connector for InMemoryBroker {
    type Channel = InMemoryChannel;

    async fn connect(&self, role: Role) -> Result<Self::Channel, tower::BoxError> {
        let mut state = self.state.lock().await;
        state.connection_attempts += 1;
        if state.unreachable {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "broker unreachable").into());
        }

        state.next_channel_id += 1;
        state.connections_opened += 1;
        let id = state.next_channel_id;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(id, Arc::clone(&open));
        tracing::debug!(%role, channel = id, "In-memory channel opened");

        Ok(InMemoryChannel {
            broker: self.clone(),
            id,
            open,
        })
    }
}

/// Channel handed out by [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl InMemoryChannel {
    fn check_open(&self) -> io::Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"))
        }
    }
}

#[async_trait::async_trait]
impl Channel for InMemoryChannel {
    type Delivery = InMemoryDelivery;

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), tower::BoxError> {
        self.check_open()?;
        let mut state = self.broker.state.lock().await;
        state.queues.entry(queue.to_owned()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        retry_count: u32,
    ) -> Result<(), tower::BoxError> {
        self.check_open()?;
        let mut state = self.broker.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "queue not declared"))?;
        q.ready.push_back(StoredMessage {
            payload: payload.to_vec(),
            retry_count,
            redelivered: false,
        });
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<Self::Delivery, tower::BoxError>>, tower::BoxError> {
        self.check_open()?;
        if !self.broker.state.lock().await.queues.contains_key(queue) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "queue not declared").into());
        }

        let broker = self.broker.clone();
        let open = Arc::clone(&self.open);
        let channel = self.id;
        let queue = queue.to_owned();

        let stream = stream! {
            loop {
                let notified = broker.notify.notified();
                if !open.load(Ordering::Acquire) {
                    break;
                }
                match broker.take_next(&queue, channel).await {
                    Some(delivery) => yield Ok::<_, tower::BoxError>(delivery),
                    None => notified.await,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), tower::BoxError> {
        let mut state = self.broker.state.lock().await;
        state.close_channel(self.id);
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

/// Delivery handed out by [`InMemoryChannel::consume`].
pub struct InMemoryDelivery {
    broker: InMemoryBroker,
    queue: String,
    tag: u64,
    message: StoredMessage,
}

#[async_trait::async_trait]
impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    fn retry_count(&self) -> u32 {
        self.message.retry_count
    }

    async fn ack(&self) -> Result<(), tower::BoxError> {
        Ok(self.broker.settle(&self.queue, self.tag, None).await?)
    }

    async fn nack(&self, requeue: bool) -> Result<(), tower::BoxError> {
        Ok(self.broker.settle(&self.queue, self.tag, Some(requeue)).await?)
    }
}
