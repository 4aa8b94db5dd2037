//! Fire-and-forget publishing of email events.
//!
//! A [`Publisher`] owns a background worker fed by a bounded channel.
//! Request-handling code holds a [`PublisherHandle`] and calls
//! [`publish`](PublisherHandle::publish), which only enqueues and never waits
//! on broker I/O. The worker then:
//!
//! - Sends each envelope through a [`Transport`], one attempt per envelope
//! - Leaves reconnects to the [`ConnectionManager`]
//! - Reports every outcome through a [`PublisherHook`]
//! - Skips envelopes taken off the buffer while the broker is unavailable
//! - Probes the broker while it is unavailable, so availability recovers
//!
//! The worker runs until its [`CancellationToken`] is triggered or every
//! handle is dropped. Envelopes still buffered at cancellation are reported
//! as dropped.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    Envelope,
    broker::Connector,
    connection::{Availability, ConnectionManager, ConnectionState},
    event::EventEnvelope,
    transport::{
        QueueHeaders, QueueSender, SenderService, Transport,
        layers::{JsonLayer, JsonService},
    },
};

/// Default transport stack: JSON over a durable broker queue.
pub type QueueTransport<C> = JsonService<SenderService<QueueSender<C>>>;

/// Email event publisher.
///
/// Generic parameters:
/// - `C`: Broker connector of the publish-role manager
/// - `T`: Transport service type
/// - `HK`: Hook implementation for lifecycle events
pub struct Publisher<C: Connector, T, HK = DefaultPublisherHook> {
    manager: Arc<ConnectionManager<C>>,
    transport: Transport<T>,
    queue: String,
    hook: HK,
    capacity: usize,
    recovery_interval: Duration,
}

impl<C: Connector> Publisher<C, QueueTransport<C>> {
    /// Publisher writing JSON envelopes to `queue` through `manager`.
    pub fn for_queue(manager: Arc<ConnectionManager<C>>, queue: impl Into<String>) -> Self {
        let transport = Transport::new(QueueSender::new(Arc::clone(&manager))).layer(JsonLayer);
        Self::new(manager, transport, queue)
    }
}

impl<C: Connector, T> Publisher<C, T> {
    /// Create a new publisher with the default hook implementation.
    ///
    /// `manager` is the publish-role manager backing `transport`; its
    /// availability decides whether envelopes are accepted at all.
    pub fn new(
        manager: Arc<ConnectionManager<C>>,
        transport: Transport<T>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            transport,
            queue: queue.into(),
            hook: DefaultPublisherHook,
            capacity: 1024,
            recovery_interval: Duration::from_secs(5),
        }
    }
}

impl<C, T, HK> Publisher<C, T, HK>
where
    C: Connector,
    T: Service<Envelope<QueueHeaders, EventEnvelope>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
    HK: PublisherHook + 'static,
{
    /// Replace the publisher hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: PublisherHook + 'static>(self, hook: HK2) -> Publisher<C, T, HK2> {
        Publisher {
            manager: self.manager,
            transport: self.transport,
            queue: self.queue,
            hook,
            capacity: self.capacity,
            recovery_interval: self.recovery_interval,
        }
    }

    /// Size of the buffer between handles and the worker.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// How often the worker probes an unavailable broker.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Start the worker task.
    pub fn spawn(self, cancel: CancellationToken) -> (PublisherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = PublisherHandle {
            tx,
            availability: self.manager.availability(),
        };
        let worker = tokio::spawn(self.run(rx, cancel));
        (handle, worker)
    }

    #[tracing::instrument(name = "publisher", skip_all, fields(queue = %self.queue))]
    async fn run(mut self, mut envelopes: mpsc::Receiver<EventEnvelope>, cancel: CancellationToken) {
        self.hook.on_startup();

        let mut probe = tokio::time::interval(self.recovery_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let unavailable = self.manager.state() == ConnectionState::Unavailable;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                envelope = envelopes.recv() => {
                    let Some(envelope) = envelope else { break };
                    if self.manager.state() == ConnectionState::Unavailable {
                        self.hook.on_unavailable(&envelope);
                        continue;
                    }
                    let interrupted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = self.publish(&envelope) => false,
                    };
                    if interrupted {
                        self.hook.on_dropped(&envelope);
                        break;
                    }
                }
                _ = probe.tick(), if unavailable => {
                    let manager = Arc::clone(&self.manager);
                    let recovered = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        channel = manager.ensure_open() => channel.is_ok(),
                    };
                    if recovered {
                        self.hook.on_recovered();
                    }
                }
            }
        }

        envelopes.close();
        while let Ok(envelope) = envelopes.try_recv() {
            self.hook.on_dropped(&envelope);
        }

        self.manager.close().await;
        self.hook.on_shutdown();
    }

    async fn publish(&mut self, envelope: &EventEnvelope) {
        let outgoing = Envelope {
            headers: QueueHeaders::new(self.queue.clone()),
            message: envelope.clone(),
        };

        match self.transport.send(outgoing).await {
            Ok(()) => self.hook.on_published(envelope),
            Err(error) => self.hook.on_publish_error(envelope, &error),
        }
    }
}

/// Result of [`PublisherHandle::publish`]. Never an error: messaging trouble
/// must not fail the business operation that produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the worker.
    Enqueued,
    /// The broker is unavailable; the envelope was dropped.
    Unavailable,
    /// The buffer is full; the envelope was dropped.
    Backpressure,
    /// The worker has stopped; the envelope was dropped.
    Closed,
}

/// Cloneable entry point to a running [`Publisher`].
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<EventEnvelope>,
    availability: Availability,
}

impl PublisherHandle {
    /// Hand `envelope` to the worker without waiting.
    pub fn publish(&self, envelope: EventEnvelope) -> PublishOutcome {
        let enrollment_id = envelope.correlation().enrollment_id;

        if !self.availability.is_available() {
            tracing::warn!(enrollment_id, "Broker unavailable, envelope not published");
            return PublishOutcome::Unavailable;
        }

        match self.tx.try_send(envelope) {
            Ok(()) => PublishOutcome::Enqueued,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(enrollment_id, "Publisher buffer full, envelope not published");
                PublishOutcome::Backpressure
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(enrollment_id, "Publisher stopped, envelope not published");
                PublishOutcome::Closed
            }
        }
    }

    /// Whether the broker is believed reachable.
    pub fn is_available(&self) -> bool {
        self.availability.is_available()
    }
}

/// Hook trait for observing publisher lifecycle events.
///
/// Hooks are invoked synchronously from the worker and should avoid heavy or
/// blocking work.
pub trait PublisherHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_published(&self, envelope: &EventEnvelope);
    fn on_publish_error(&self, envelope: &EventEnvelope, error: &dyn std::error::Error);
    fn on_dropped(&self, envelope: &EventEnvelope);
    /// The envelope was buffered before the broker became unavailable.
    fn on_unavailable(&self, envelope: &EventEnvelope);
    fn on_recovered(&self);
}

/// Default publisher hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultPublisherHook;

impl PublisherHook for DefaultPublisherHook {
    fn on_startup(&self) {
        tracing::info!("Publisher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Publisher is shutting down");
    }

    fn on_published(&self, envelope: &EventEnvelope) {
        tracing::debug!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            "Envelope published"
        );
    }

    fn on_publish_error(&self, envelope: &EventEnvelope, error: &dyn std::error::Error) {
        tracing::error!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            %error,
            "Error publishing envelope"
        );
    }

    fn on_dropped(&self, envelope: &EventEnvelope) {
        tracing::warn!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            "Envelope dropped at shutdown"
        );
    }

    fn on_unavailable(&self, envelope: &EventEnvelope) {
        tracing::warn!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            "Broker unavailable, envelope not published"
        );
    }

    fn on_recovered(&self) {
        tracing::info!("Broker reachable again");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        broker::{InMemoryBroker, Role},
        connection::RetryPolicy,
        event::Correlation,
        transport::{InMemory, RawPayload},
    };

    const QUEUE: &str = "email_sent_queue";

    fn envelope(enrollment_id: u64) -> EventEnvelope {
        let correlation = Correlation {
            enrollment_id,
            student_id: 1,
            section_id: 2,
        };
        EventEnvelope::pending(correlation, "a@b.com", "S", "B").unwrap()
    }

    fn manager(broker: &InMemoryBroker, max_attempts: u32) -> Arc<ConnectionManager<InMemoryBroker>> {
        let policy = RetryPolicy {
            max_attempts,
            delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        };
        Arc::new(ConnectionManager::new(broker.clone(), Role::Publish, policy).declare_queue(QUEUE))
    }

    #[derive(Clone, Default)]
    struct RecordingHook {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingHook {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl PublisherHook for RecordingHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {
            self.push("shutdown".into());
        }
        fn on_published(&self, envelope: &EventEnvelope) {
            self.push(format!("published {}", envelope.correlation().enrollment_id));
        }
        fn on_publish_error(&self, envelope: &EventEnvelope, _error: &dyn std::error::Error) {
            self.push(format!("error {}", envelope.correlation().enrollment_id));
        }
        fn on_dropped(&self, envelope: &EventEnvelope) {
            self.push(format!("dropped {}", envelope.correlation().enrollment_id));
        }
        fn on_unavailable(&self, envelope: &EventEnvelope) {
            self.push(format!("unavailable {}", envelope.correlation().enrollment_id));
        }
        fn on_recovered(&self) {
            self.push("recovered".into());
        }
    }

    #[tokio::test]
    async fn published_envelopes_wait_in_the_queue_without_a_consumer() {
        let broker = InMemoryBroker::new();
        let (handle, worker) =
            Publisher::for_queue(manager(&broker, 3), QUEUE).spawn(CancellationToken::new());

        let sent = envelope(1);
        assert_eq!(handle.publish(sent.clone()), PublishOutcome::Enqueued);
        drop(handle);
        worker.await.unwrap();

        let stored = broker.ready_messages(QUEUE).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(EventEnvelope::from_json(&stored[0]).unwrap(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_is_reported_until_it_recovers() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        let hook = RecordingHook::default();
        let (handle, worker) = Publisher::for_queue(manager(&broker, 3), QUEUE)
            .with_hook(hook.clone())
            .spawn(CancellationToken::new());

        assert_eq!(handle.publish(envelope(1)), PublishOutcome::Enqueued);
        while handle.is_available() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(handle.publish(envelope(2)), PublishOutcome::Unavailable);

        broker.set_reachable(true).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_available());

        assert_eq!(handle.publish(envelope(3)), PublishOutcome::Enqueued);
        drop(handle);
        worker.await.unwrap();

        assert_eq!(broker.depth(QUEUE).await, 1);
        assert_eq!(
            hook.events(),
            vec!["error 1", "recovered", "published 3", "shutdown"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn envelopes_buffered_during_an_outage_share_one_retry_budget() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        let hook = RecordingHook::default();
        let (handle, worker) = Publisher::for_queue(manager(&broker, 3), QUEUE)
            .with_hook(hook.clone())
            .spawn(CancellationToken::new());

        for id in 1..=5 {
            assert_eq!(handle.publish(envelope(id)), PublishOutcome::Enqueued);
        }
        drop(handle);
        worker.await.unwrap();

        assert_eq!(broker.connection_attempts().await, 3);
        assert_eq!(
            hook.events(),
            vec![
                "error 1",
                "unavailable 2",
                "unavailable 3",
                "unavailable 4",
                "unavailable 5",
                "shutdown"
            ]
        );
    }

    #[tokio::test]
    async fn send_failures_are_reported_and_the_worker_keeps_going() {
        let broker = InMemoryBroker::new();
        let memory: InMemory<QueueHeaders, RawPayload> = InMemory::default();
        memory.fail_next(1).await;
        let hook = RecordingHook::default();
        let transport = Transport::new(memory.clone()).layer(JsonLayer);
        let (handle, worker) = Publisher::new(manager(&broker, 1), transport, QUEUE)
            .with_hook(hook.clone())
            .spawn(CancellationToken::new());

        handle.publish(envelope(1));
        handle.publish(envelope(2));
        drop(handle);
        worker.await.unwrap();

        assert_eq!(hook.events(), vec!["error 1", "published 2", "shutdown"]);
        let sent = memory.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers, QueueHeaders::new(QUEUE));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_buffered_envelopes_and_closes_the_manager() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        let manager = manager(&broker, 10);
        let hook = RecordingHook::default();
        let cancel = CancellationToken::new();
        let (handle, worker) = Publisher::for_queue(Arc::clone(&manager), QUEUE)
            .with_hook(hook.clone())
            .spawn(cancel.clone());

        for id in 1..=3 {
            assert_eq!(handle.publish(envelope(id)), PublishOutcome::Enqueued);
        }
        // the worker is now stuck reconnecting for the first envelope
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(
            hook.events(),
            vec!["dropped 1", "dropped 2", "dropped 3", "shutdown"]
        );
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(handle.publish(envelope(4)), PublishOutcome::Unavailable);
    }

    #[tokio::test]
    async fn full_buffer_reports_backpressure() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let (handle, worker) = Publisher::for_queue(manager(&broker, 1), QUEUE)
            .with_capacity(1)
            .spawn(cancel.clone());

        // the worker has not been polled yet on this single-threaded runtime
        assert_eq!(handle.publish(envelope(1)), PublishOutcome::Enqueued);
        assert_eq!(handle.publish(envelope(2)), PublishOutcome::Backpressure);

        cancel.cancel();
        worker.await.unwrap();
    }
}
