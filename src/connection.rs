//! Connection lifecycle for one broker role.
//!
//! A [`ConnectionManager`] owns at most one live channel (and the connection
//! behind it) for a [`Role`]. Every user calls
//! [`ensure_open`](ConnectionManager::ensure_open) before touching the
//! channel; a closed channel is replaced under a lock so concurrent callers
//! share a single reconnect.
//!
//! Reconnecting follows a bounded, fixed-delay [`RetryPolicy`]. When it is
//! exhausted the manager reports [`ConnectionState::Unavailable`] instead of
//! retrying forever, and dependents can check
//! [`is_available`](ConnectionManager::is_available) to degrade gracefully.
//! Every wait observes the manager's cancellation token, so
//! [`close`](ConnectionManager::close) is prompt even mid-retry.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::broker::{Channel, Connector, Role};

/// Bounded fixed-delay reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connection attempts before giving up.
    pub max_attempts: u32,
    /// Pause between two attempts.
    pub delay: Duration,
    /// Upper bound for a single attempt.
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No connection attempted yet, or the last channel was dropped.
    Disconnected = 0,
    Connected = 1,
    /// The last reconnect exhausted its retry budget.
    Unavailable = 2,
    /// [`ConnectionManager::close`] was called. Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Unavailable,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Cheap read-only view of a manager's state.
#[derive(Debug, Clone)]
pub struct Availability(Arc<AtomicU8>);

impl Availability {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)))
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `false` once retries were exhausted or the manager was closed.
    pub fn is_available(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Connected
        )
    }

    fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

/// Owner of the connection and channel used by one role.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    role: Role,
    policy: RetryPolicy,
    queues: Vec<String>,
    channel: Mutex<Option<C::Channel>>,
    availability: Availability,
    cancel: CancellationToken,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, role: Role, policy: RetryPolicy) -> Self {
        Self {
            connector,
            role,
            policy,
            queues: Vec::new(),
            channel: Mutex::new(None),
            availability: Availability::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Declare `queue` as durable on every channel this manager opens.
    pub fn declare_queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    /// Tie the manager's retry waits to an outer cancellation token.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.availability.state()
    }

    pub fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    pub fn availability(&self) -> Availability {
        self.availability.clone()
    }

    /// Open a fresh channel, replacing the current one.
    #[tracing::instrument(skip(self), fields(role = %self.role))]
    pub async fn connect(&self) -> Result<C::Channel, ConnectionError> {
        let mut slot = self.channel.lock().await;
        self.reconnect(&mut slot).await
    }

    /// Return the current channel, reconnecting first if it is closed.
    pub async fn ensure_open(&self) -> Result<C::Channel, ConnectionError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            tracing::info!(role = %self.role, "Broker channel closed, reconnecting");
        }
        self.reconnect(&mut slot).await
    }

    /// Release the channel and connection. Idempotent; the manager cannot be
    /// reopened afterwards.
    #[tracing::instrument(skip(self), fields(role = %self.role))]
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut slot = self.channel.lock().await;
        let previous = self.availability.set(ConnectionState::Closed);

        if let Some(channel) = slot.take() {
            if let Err(error) = channel.close().await {
                tracing::warn!(%error, "Error while closing broker channel");
            }
        }
        if previous != ConnectionState::Closed {
            tracing::info!("Broker connection closed");
        }
    }

    async fn reconnect(&self, slot: &mut Option<C::Channel>) -> Result<C::Channel, ConnectionError> {
        if self.cancel.is_cancelled() || self.state() == ConnectionState::Closed {
            return Err(ConnectionError::closed());
        }

        if let Some(stale) = slot.take() {
            self.availability.set(ConnectionState::Disconnected);
            if let Err(error) = stale.close().await {
                tracing::debug!(%error, "Stale channel did not close cleanly");
            }
        }

        let channel = self.connect_with_retry().await?;
        *slot = Some(channel.clone());
        Ok(channel)
    }

    async fn connect_with_retry(&self) -> Result<C::Channel, ConnectionError> {
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ConnectionError::cancelled()),
                outcome = tokio::time::timeout(self.policy.connect_timeout, self.open_channel()) => outcome,
            };

            match outcome {
                Ok(Ok(channel)) => {
                    self.availability.set(ConnectionState::Connected);
                    tracing::info!(role = %self.role, attempt, "Connected to broker");
                    return Ok(channel);
                }
                Ok(Err(error)) => {
                    tracing::warn!(role = %self.role, attempt, attempts, %error, "Broker connection attempt failed");
                }
                Err(_) => {
                    tracing::warn!(role = %self.role, attempt, attempts, "Broker connection attempt timed out");
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(ConnectionError::cancelled()),
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }
        }

        self.availability.set(ConnectionState::Unavailable);
        tracing::error!(role = %self.role, attempts, "Broker unavailable after exhausting retries");
        Err(ConnectionError::unavailable(attempts))
    }

    async fn open_channel(&self) -> Result<C::Channel, tower::BoxError> {
        let channel = self.connector.connect(self.role).await?;
        for queue in &self.queues {
            if let Err(error) = channel.declare_queue(queue).await {
                let _ = channel.close().await;
                return Err(error);
            }
        }
        Ok(channel)
    }
}

/// Error returned when no channel could be provided.
#[derive(Debug)]
pub struct ConnectionError {
    context: SpanTrace,
    kind: ConnectionErrorKind,
}

/// Connection error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Every attempt of the retry policy failed.
    Unavailable { attempts: u32 },
    /// The manager was closed.
    Closed,
    /// A retry wait was interrupted by cancellation.
    Cancelled,
}

impl ConnectionError {
    fn unavailable(attempts: u32) -> Self {
        Self::new(ConnectionErrorKind::Unavailable { attempts })
    }

    fn closed() -> Self {
        Self::new(ConnectionErrorKind::Closed)
    }

    fn cancelled() -> Self {
        Self::new(ConnectionErrorKind::Cancelled)
    }

    fn new(kind: ConnectionErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> ConnectionErrorKind {
        self.kind
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConnectionErrorKind::Unavailable { attempts } => {
                writeln!(f, "Broker unavailable after {attempts} attempts")
            }
            ConnectionErrorKind::Closed => writeln!(f, "Connection manager closed"),
            ConnectionErrorKind::Cancelled => writeln!(f, "Connection attempt cancelled"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConnectionError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    const QUEUE: &str = "email_sent_queue";

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
        }
    }

    /// Connector that takes a while to connect, widening the race window.
    struct Slow(InMemoryBroker);

    #[async_trait::async_trait]
    impl Connector for Slow {
        type Channel = <InMemoryBroker as Connector>::Channel;

        async fn connect(&self, role: Role) -> Result<Self::Channel, tower::BoxError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.connect(role).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensure_open_opens_a_single_connection() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(ConnectionManager::new(
            Slow(broker.clone()),
            Role::Publish,
            policy(3),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.ensure_open().await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.connections_opened().await, 1);
        assert_eq!(broker.open_channels().await, 1);
    }

    #[tokio::test]
    async fn connect_declares_durable_queues() {
        let broker = InMemoryBroker::new();
        let manager =
            ConnectionManager::new(broker.clone(), Role::Publish, policy(1)).declare_queue(QUEUE);

        let channel = manager.ensure_open().await.unwrap();
        channel.publish(QUEUE, b"{}", 0).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.depth(QUEUE).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_the_manager_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        let manager = ConnectionManager::new(broker.clone(), Role::Publish, policy(3));

        let started = tokio::time::Instant::now();
        let err = manager.ensure_open().await.unwrap_err();

        assert_eq!(err.kind(), ConnectionErrorKind::Unavailable { attempts: 3 });
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!manager.is_available());

        broker.set_reachable(true).await;
        manager.ensure_open().await.unwrap();
        assert!(manager.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_succeeds_once_the_broker_recovers() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        let manager = Arc::new(ConnectionManager::new(broker.clone(), Role::Consume, policy(5)));

        let pending = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.ensure_open().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_secs(6)).await;
        broker.set_reachable(true).await;

        pending.await.unwrap().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn closed_channels_are_replaced() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), Role::Consume, policy(1));

        let first = manager.ensure_open().await.unwrap();
        first.close().await.unwrap();
        let second = manager.ensure_open().await.unwrap();

        assert!(second.is_open());
        assert_eq!(broker.connections_opened().await, 2);
        assert_eq!(broker.open_channels().await, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), Role::Publish, policy(1));
        manager.ensure_open().await.unwrap();

        manager.close().await;
        manager.close().await;

        assert_eq!(broker.open_channels().await, 0);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(
            manager.ensure_open().await.unwrap_err().kind(),
            ConnectionErrorKind::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_a_retry_loop() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        let manager = Arc::new(ConnectionManager::new(broker, Role::Publish, policy(10)));

        let pending = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.ensure_open().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ConnectionErrorKind::Cancelled);
    }
}
