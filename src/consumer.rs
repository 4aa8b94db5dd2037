//! Background consumer delivering queued email events.
//!
//! A [`Consumer`] subscribes to one durable queue with manual acknowledgement
//! and a prefetch of one. Each delivery is processed to completion before the
//! next one is pulled:
//!
//! - Undecodable payloads are acknowledged and logged, never requeued
//! - The [`EmailSender`] call is bounded by [`ConsumerSettings::send_timeout`]
//! - Success acknowledges the delivery and mirrors the sent envelope
//! - Failure is settled according to the [`RedeliveryPolicy`]
//!
//! A lost channel or a failed subscription is retried after
//! [`ConsumerSettings::resubscribe_delay`]; the consumer only stops when its
//! [`CancellationToken`] is triggered, and it closes its connection on the way
//! out. A delivery interrupted by cancellation stays unacknowledged and is
//! redelivered by the broker.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::{Channel, Connector, Delivery},
    connection::ConnectionManager,
    email::{EmailSender, SendError},
    event::EventEnvelope,
    sink::LogSinkHandle,
};

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub consumer_tag: String,
    /// Upper bound for one [`EmailSender::send`] call.
    pub send_timeout: Duration,
    /// Pause before subscribing again after a lost channel.
    pub resubscribe_delay: Duration,
    pub redelivery: RedeliveryPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: "email_sent_queue".to_owned(),
            consumer_tag: "mailchute-consumer".to_owned(),
            send_timeout: Duration::from_secs(30),
            resubscribe_delay: Duration::from_secs(5),
            redelivery: RedeliveryPolicy::Unbounded,
        }
    }
}

/// What happens to a delivery whose email could not be sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RedeliveryPolicy {
    /// Nack with requeue on every failure.
    #[default]
    Unbounded,
    /// Requeue transient failures up to `max_deliveries` deliveries, then
    /// move the message to `queue`. Permanent failures move immediately.
    DeadLetter { max_deliveries: u32, queue: String },
}

/// Record published to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Original message body, lossily decoded as UTF-8.
    pub payload: String,
    /// The decoded envelope, when the payload was one.
    pub envelope: Option<EventEnvelope>,
    pub reason: String,
    /// Deliveries made before giving up.
    pub deliveries: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Queue consumer.
///
/// Generic parameters:
/// - `C`: Broker connector of the consume-role manager
/// - `E`: Email sender
/// - `HK`: Hook implementation for lifecycle events
pub struct Consumer<C: Connector, E, HK = DefaultConsumerHook> {
    manager: Arc<ConnectionManager<C>>,
    sender: E,
    settings: ConsumerSettings,
    log_sink: Option<LogSinkHandle>,
    hook: HK,
}

type Deliveries<C> =
    BoxStream<'static, Result<<<C as Connector>::Channel as Channel>::Delivery, tower::BoxError>>;

enum Stop {
    Cancelled,
    Lost,
}

impl<C: Connector, E: EmailSender> Consumer<C, E> {
    /// Create a new consumer with the default hook implementation.
    pub fn new(manager: Arc<ConnectionManager<C>>, sender: E, settings: ConsumerSettings) -> Self {
        Self {
            manager,
            sender,
            settings,
            log_sink: None,
            hook: DefaultConsumerHook,
        }
    }
}

impl<C, E, HK> Consumer<C, E, HK>
where
    C: Connector,
    E: EmailSender,
    HK: ConsumerHook,
{
    /// Replace the consumer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<C, E, HK2> {
        Consumer {
            manager: self.manager,
            sender: self.sender,
            settings: self.settings,
            log_sink: self.log_sink,
            hook,
        }
    }

    /// Mirror settled envelopes to a log sink.
    pub fn with_log_sink(mut self, sink: LogSinkHandle) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Run the consumer loop until `cancel` is triggered.
    #[tracing::instrument(name = "consumer", skip_all, fields(queue = %self.settings.queue))]
    pub async fn run(self, cancel: CancellationToken) {
        self.hook.on_startup();

        loop {
            let subscription = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                subscription = self.subscribe() => subscription,
            };

            match subscription {
                Ok((channel, deliveries)) => {
                    self.hook.on_subscribed(&self.settings.queue);
                    match self.consume(&channel, deliveries, &cancel).await {
                        Stop::Cancelled => break,
                        Stop::Lost => self.hook.on_subscription_lost(),
                    }
                }
                Err(error) => self.hook.on_subscribe_error(error.as_ref()),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.resubscribe_delay) => {}
            }
        }

        self.manager.close().await;
        self.hook.on_shutdown();
    }

    async fn subscribe(&self) -> Result<(C::Channel, Deliveries<C>), tower::BoxError> {
        let channel = self.manager.ensure_open().await?;
        channel.declare_queue(&self.settings.queue).await?;
        if let RedeliveryPolicy::DeadLetter { queue, .. } = &self.settings.redelivery {
            channel.declare_queue(queue).await?;
        }
        let deliveries = channel
            .consume(&self.settings.queue, &self.settings.consumer_tag)
            .await?;
        Ok((channel, deliveries))
    }

    async fn consume(
        &self,
        channel: &C::Channel,
        mut deliveries: Deliveries<C>,
        cancel: &CancellationToken,
    ) -> Stop {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Stop::Cancelled,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Stop::Cancelled,
                        _ = self.handle(channel, delivery) => {}
                    }
                }
                Some(Err(error)) => {
                    self.hook.on_subscribe_error(error.as_ref());
                    return Stop::Lost;
                }
                None => return Stop::Lost,
            }
        }
    }

    async fn handle(&self, channel: &C::Channel, delivery: <C::Channel as Channel>::Delivery) {
        let envelope = match EventEnvelope::from_json(delivery.payload()) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.hook.on_decode_error(&error);
                if let RedeliveryPolicy::DeadLetter { queue, .. } = &self.settings.redelivery {
                    let record = self.dead_letter(&delivery, None, format!("undecodable payload: {error}"));
                    self.publish_dead_letter(channel, queue, &record).await;
                }
                self.ack(&delivery).await;
                return;
            }
        };

        self.hook.on_received(&envelope, delivery.redelivered());

        let timeout = self.settings.send_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            self.sender
                .send(envelope.to(), envelope.subject(), envelope.body()),
        )
        .await
        .unwrap_or_else(|_| Err(SendError::timed_out(timeout)));

        match outcome {
            Ok(()) => {
                if self.ack(&delivery).await {
                    self.hook.on_delivered(&envelope);
                    if let Ok(sent) = envelope.mark_sent(Utc::now()) {
                        self.mirror(&sent);
                    }
                }
            }
            Err(error) => {
                self.hook.on_send_error(&envelope, &error);
                self.redeliver(channel, delivery, envelope, error).await;
            }
        }
    }

    async fn redeliver(
        &self,
        channel: &C::Channel,
        delivery: <C::Channel as Channel>::Delivery,
        envelope: EventEnvelope,
        error: SendError,
    ) {
        let (max_deliveries, dead_letter_queue) = match &self.settings.redelivery {
            RedeliveryPolicy::Unbounded => {
                self.nack_requeue(&delivery, &envelope).await;
                return;
            }
            RedeliveryPolicy::DeadLetter {
                max_deliveries,
                queue,
            } => (*max_deliveries, queue),
        };

        let deliveries = delivery.retry_count().saturating_add(1);

        if error.is_transient() && deliveries < max_deliveries {
            match channel
                .publish(&self.settings.queue, delivery.payload(), deliveries)
                .await
            {
                Ok(()) => {
                    if self.ack(&delivery).await {
                        self.hook.on_requeued(&envelope, deliveries);
                    }
                }
                Err(republish) => {
                    self.hook.on_settle_error(republish.as_ref());
                    self.nack_requeue(&delivery, &envelope).await;
                }
            }
            return;
        }

        let record = self.dead_letter(&delivery, Some(envelope.clone()), error.to_string());
        if !self
            .publish_dead_letter(channel, dead_letter_queue, &record)
            .await
        {
            self.nack_requeue(&delivery, &envelope).await;
            return;
        }
        if self.ack(&delivery).await {
            if let Ok(failed) = envelope.mark_failed(record.reason.clone(), record.dead_lettered_at) {
                self.mirror(&failed);
            }
        }
    }

    fn dead_letter(
        &self,
        delivery: &<C::Channel as Channel>::Delivery,
        envelope: Option<EventEnvelope>,
        reason: String,
    ) -> DeadLetter {
        DeadLetter {
            payload: String::from_utf8_lossy(delivery.payload()).into_owned(),
            envelope,
            reason,
            deliveries: delivery.retry_count().saturating_add(1),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Whether `record` reached the dead-letter queue.
    async fn publish_dead_letter(
        &self,
        channel: &C::Channel,
        queue: &str,
        record: &DeadLetter,
    ) -> bool {
        let payload = match serde_json::to_vec(record) {
            Ok(payload) => payload,
            Err(error) => {
                self.hook.on_settle_error(&error);
                return false;
            }
        };

        match channel.publish(queue, &payload, record.deliveries).await {
            Ok(()) => {
                self.hook.on_dead_lettered(record);
                true
            }
            Err(error) => {
                self.hook.on_settle_error(error.as_ref());
                false
            }
        }
    }

    async fn ack(&self, delivery: &<C::Channel as Channel>::Delivery) -> bool {
        match delivery.ack().await {
            Ok(()) => true,
            Err(error) => {
                self.hook.on_settle_error(error.as_ref());
                false
            }
        }
    }

    async fn nack_requeue(&self, delivery: &<C::Channel as Channel>::Delivery, envelope: &EventEnvelope) {
        match delivery.nack(true).await {
            Ok(()) => self.hook.on_nacked(envelope, delivery.redelivered()),
            Err(error) => self.hook.on_settle_error(error.as_ref()),
        }
    }

    fn mirror(&self, envelope: &EventEnvelope) {
        if let Some(sink) = &self.log_sink {
            sink.mirror(envelope);
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync + 'static {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_subscribed(&self, queue: &str);
    fn on_subscribe_error(&self, error: &(dyn std::error::Error + Send + Sync));
    fn on_subscription_lost(&self);
    fn on_received(&self, envelope: &EventEnvelope, redelivered: bool);
    fn on_decode_error(&self, error: &serde_json::Error);
    fn on_delivered(&self, envelope: &EventEnvelope);
    fn on_send_error(&self, envelope: &EventEnvelope, error: &SendError);
    /// Nacked with requeue; the broker redelivers the same message.
    fn on_nacked(&self, envelope: &EventEnvelope, redelivered: bool);
    /// Republished to the source queue carrying `retry_count`.
    fn on_requeued(&self, envelope: &EventEnvelope, retry_count: u32);
    fn on_dead_lettered(&self, record: &DeadLetter);
    fn on_settle_error(&self, error: &dyn std::error::Error);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_subscribed(&self, queue: &str) {
        tracing::info!(queue, "Waiting for messages");
    }

    fn on_subscribe_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        tracing::error!(%error, "Error subscribing to queue");
    }

    fn on_subscription_lost(&self) {
        tracing::warn!("Subscription lost, resubscribing");
    }

    fn on_received(&self, envelope: &EventEnvelope, redelivered: bool) {
        tracing::debug!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            redelivered,
            "Message received"
        );
    }

    fn on_decode_error(&self, error: &serde_json::Error) {
        tracing::error!(%error, "Discarding undecodable message");
    }

    fn on_delivered(&self, envelope: &EventEnvelope) {
        tracing::info!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            "Email sent"
        );
    }

    fn on_send_error(&self, envelope: &EventEnvelope, error: &SendError) {
        tracing::error!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            %error,
            "Error sending email"
        );
    }

    fn on_nacked(&self, envelope: &EventEnvelope, redelivered: bool) {
        tracing::warn!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            redelivered,
            "Message returned to the queue"
        );
    }

    fn on_requeued(&self, envelope: &EventEnvelope, retry_count: u32) {
        tracing::warn!(
            id = %envelope.id(),
            enrollment_id = envelope.correlation().enrollment_id,
            retry_count,
            "Message requeued"
        );
    }

    fn on_dead_lettered(&self, record: &DeadLetter) {
        tracing::error!(
            deliveries = record.deliveries,
            reason = %record.reason,
            "Message moved to the dead-letter queue"
        );
    }

    fn on_settle_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Error settling message");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::Mutex,
    };

    use super::*;
    use crate::{
        broker::{InMemoryBroker, Role},
        connection::RetryPolicy,
        event::{Correlation, EventKind},
        publisher::{PublishOutcome, Publisher},
        sink::{LogHeaders, LogSink, LogTopics},
        transport::{InMemory, RawPayload, Transport, layers::JsonLayer},
    };

    const QUEUE: &str = "email_sent_queue";
    const DLQ: &str = "email_dead_letters";

    fn envelope() -> EventEnvelope {
        let correlation = Correlation {
            enrollment_id: 5,
            student_id: 6,
            section_id: 7,
        };
        EventEnvelope::pending(correlation, "a@b.com", "S", "B").unwrap()
    }

    fn manager(broker: &InMemoryBroker, role: Role) -> Arc<ConnectionManager<InMemoryBroker>> {
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        };
        Arc::new(ConnectionManager::new(broker.clone(), role, policy).declare_queue(QUEUE))
    }

    fn settings(redelivery: RedeliveryPolicy) -> ConsumerSettings {
        ConsumerSettings {
            redelivery,
            ..ConsumerSettings::default()
        }
    }

    fn dead_letter_policy(max_deliveries: u32) -> RedeliveryPolicy {
        RedeliveryPolicy::DeadLetter {
            max_deliveries,
            queue: DLQ.to_owned(),
        }
    }

    async fn settled(broker: &InMemoryBroker, queue: &str, depth: usize) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while broker.depth(queue).await != depth {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Succeed,
        Transient,
        Permanent,
        Hang,
    }

    #[derive(Clone, Default)]
    struct ScriptedSender {
        script: Arc<Mutex<VecDeque<Step>>>,
        calls: Arc<Mutex<Vec<(String, String, String)>>>,
    }

    impl ScriptedSender {
        fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
            let sender = Self::default();
            sender.script.lock().unwrap().extend(steps);
            sender
        }

        fn calls(&self) -> Vec<(String, String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl EmailSender for ScriptedSender {
        async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError> {
            self.calls
                .lock()
                .unwrap()
                .push((to.to_owned(), subject.to_owned(), body.to_owned()));
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);

            match step {
                Step::Succeed => Ok(()),
                Step::Transient => Err(SendError::transient(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "smtp down",
                ))),
                Step::Permanent => Err(SendError::permanent("mailbox does not exist")),
                Step::Hang => std::future::pending().await,
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingHook {
        received: Arc<Mutex<Vec<bool>>>,
        nacked: Arc<Mutex<Vec<bool>>>,
    }

    impl ConsumerHook for RecordingHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_subscribed(&self, _queue: &str) {}
        fn on_subscribe_error(&self, _error: &(dyn std::error::Error + Send + Sync)) {}
        fn on_subscription_lost(&self) {}
        fn on_received(&self, _envelope: &EventEnvelope, redelivered: bool) {
            self.received.lock().unwrap().push(redelivered);
        }
        fn on_decode_error(&self, _error: &serde_json::Error) {}
        fn on_delivered(&self, _envelope: &EventEnvelope) {}
        fn on_send_error(&self, _envelope: &EventEnvelope, _error: &SendError) {}
        fn on_nacked(&self, _envelope: &EventEnvelope, redelivered: bool) {
            self.nacked.lock().unwrap().push(redelivered);
        }
        fn on_requeued(&self, _envelope: &EventEnvelope, _retry_count: u32) {}
        fn on_dead_lettered(&self, _record: &DeadLetter) {}
        fn on_settle_error(&self, _error: &dyn std::error::Error) {}
    }

    #[tokio::test]
    async fn published_envelope_is_sent_and_acknowledged() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::default();
        let (publisher, publisher_task) =
            Publisher::for_queue(manager(&broker, Role::Publish), QUEUE).spawn(cancel.clone());
        let consumer = Consumer::new(
            manager(&broker, Role::Consume),
            sender.clone(),
            ConsumerSettings::default(),
        );
        let consumer_task = tokio::spawn(consumer.run(cancel.clone()));

        assert_eq!(publisher.publish(envelope()), PublishOutcome::Enqueued);
        tokio::time::timeout(Duration::from_secs(5), async {
            while sender.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        settled(&broker, QUEUE, 0).await;

        cancel.cancel();
        publisher_task.await.unwrap();
        consumer_task.await.unwrap();

        assert_eq!(
            sender.calls(),
            vec![("a@b.com".to_owned(), "S".to_owned(), "B".to_owned())]
        );
        assert_eq!(broker.open_channels().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_send_is_requeued_and_redelivered() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::with_script([Step::Hang, Step::Succeed]);
        let hook = RecordingHook::default();
        let consumer = Consumer::new(manager(&broker, Role::Consume), sender.clone(), ConsumerSettings::default())
            .with_hook(hook.clone());
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sender.calls().len(), 2);
        assert_eq!(*hook.received.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn unacknowledged_delivery_survives_a_consumer_crash() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;

        let first_cancel = CancellationToken::new();
        let hanging = ScriptedSender::with_script([Step::Hang]);
        let first = Consumer::new(manager(&broker, Role::Consume), hanging.clone(), ConsumerSettings::default());
        let first_task = tokio::spawn(first.run(first_cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while hanging.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        first_cancel.cancel();
        first_task.await.unwrap();
        assert_eq!(broker.depth(QUEUE).await, 1);

        let second_cancel = CancellationToken::new();
        let hook = RecordingHook::default();
        let second = Consumer::new(
            manager(&broker, Role::Consume),
            ScriptedSender::default(),
            ConsumerSettings::default(),
        )
        .with_hook(hook.clone());
        let second_task = tokio::spawn(second.run(second_cancel.clone()));
        settled(&broker, QUEUE, 0).await;
        second_cancel.cancel();
        second_task.await.unwrap();

        assert_eq!(*hook.received.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn undecodable_message_is_removed_after_one_delivery() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, b"not json".to_vec()).await;
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::default();
        let consumer = Consumer::new(manager(&broker, Role::Consume), sender.clone(), ConsumerSettings::default());
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(sender.calls().is_empty());
    }

    #[tokio::test]
    async fn envelope_with_unusable_recipient_is_not_requeued() {
        let broker = InMemoryBroker::new();
        let mut value = serde_json::to_value(envelope()).unwrap();
        value["to"] = serde_json::Value::String("nobody".into());
        broker.inject(QUEUE, serde_json::to_vec(&value).unwrap()).await;
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::default();
        let hook = RecordingHook::default();
        let consumer = Consumer::new(manager(&broker, Role::Consume), sender.clone(), ConsumerSettings::default())
            .with_hook(hook.clone());
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(sender.calls().is_empty());
        assert!(hook.nacked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_dead_lettered_after_max_deliveries() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::with_script([Step::Transient; 5]);
        let consumer = Consumer::new(
            manager(&broker, Role::Consume),
            sender.clone(),
            settings(dead_letter_policy(3)),
        );
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, DLQ, 1).await;
        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sender.calls().len(), 3);
        let stored = broker.ready_messages(DLQ).await;
        let record: DeadLetter = serde_json::from_slice(&stored[0]).unwrap();
        assert_eq!(record.deliveries, 3);
        assert_eq!(record.envelope.unwrap().to(), "a@b.com");
        assert!(record.reason.contains("smtp down"));
    }

    #[tokio::test]
    async fn permanent_failures_are_dead_lettered_immediately() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::with_script([Step::Permanent]);
        let consumer = Consumer::new(
            manager(&broker, Role::Consume),
            sender.clone(),
            settings(dead_letter_policy(5)),
        );
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, DLQ, 1).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sender.calls().len(), 1);
        assert_eq!(broker.depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn unbounded_policy_requeues_permanent_failures_too() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::with_script([Step::Permanent, Step::Permanent]);
        let hook = RecordingHook::default();
        let consumer = Consumer::new(manager(&broker, Role::Consume), sender.clone(), ConsumerSettings::default())
            .with_hook(hook.clone());
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sender.calls().len(), 3);
        assert_eq!(*hook.nacked.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn sent_and_failed_envelopes_are_mirrored() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        let cancel = CancellationToken::new();
        let memory: InMemory<LogHeaders, RawPayload> = InMemory::default();
        // stops once the consumer drops its handle
        let (sink, sink_task) = LogSink::new(
            Transport::new(memory.clone()).layer(JsonLayer),
            LogTopics::default(),
        )
        .spawn(CancellationToken::new());
        let consumer = Consumer::new(
            manager(&broker, Role::Consume),
            ScriptedSender::with_script([Step::Succeed, Step::Permanent]),
            settings(dead_letter_policy(5)),
        )
        .with_log_sink(sink);
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, DLQ, 1).await;
        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();
        sink_task.await.unwrap();

        let kinds: Vec<EventKind> = memory
            .sent_messages()
            .await
            .into_iter()
            .map(|sent| EventEnvelope::from_json(&sent.message.into_inner()).unwrap().kind().clone())
            .collect();
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds[0], EventKind::Sent { .. }));
        assert!(matches!(kinds[1], EventKind::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_log_sink_does_not_affect_delivery() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        let cancel = CancellationToken::new();
        let memory: InMemory<LogHeaders, RawPayload> = InMemory::default();
        memory.fail_next(usize::MAX).await;
        let (sink, _sink_task) = LogSink::new(
            Transport::new(memory.clone()).layer(JsonLayer),
            LogTopics::default(),
        )
        .spawn(cancel.clone());
        let sender = ScriptedSender::default();
        let consumer = Consumer::new(manager(&broker, Role::Consume), sender.clone(), ConsumerSettings::default())
            .with_log_sink(sink);
        let task = tokio::spawn(consumer.run(cancel.clone()));

        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sender.calls().len(), 1);
        assert!(memory.sent_messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_waits_for_the_broker_at_startup() {
        let broker = InMemoryBroker::new();
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;
        broker.set_reachable(false).await;
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::default();
        let consumer = Consumer::new(manager(&broker, Role::Consume), sender.clone(), ConsumerSettings::default());
        let task = tokio::spawn(consumer.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(sender.calls().is_empty());

        broker.set_reachable(true).await;
        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sender.calls().len(), 1);
    }

    #[tokio::test]
    async fn consumer_resubscribes_after_an_outage() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let sender = ScriptedSender::default();
        let settings = ConsumerSettings {
            resubscribe_delay: Duration::from_millis(20),
            ..ConsumerSettings::default()
        };
        let manager = manager(&broker, Role::Consume);
        let consumer = Consumer::new(Arc::clone(&manager), sender.clone(), settings);
        let task = tokio::spawn(consumer.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.set_reachable(false).await;
        broker.set_reachable(true).await;
        broker.inject(QUEUE, envelope().to_json().unwrap()).await;

        settled(&broker, QUEUE, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sender.calls().len(), 1);
        assert_eq!(broker.connections_opened().await, 2);
    }
}
