//! Best-effort mirror of pipeline events to a log stream.
//!
//! The [`LogSink`] runs as its own background task with its own retry policy.
//! Producers hold a [`LogSinkHandle`] whose methods never block, never fail
//! and never wait for the stream: when the buffer is full, or the stream
//! keeps failing, records are dropped with a log line. The email delivery
//! path does not depend on the sink in any way.

use std::time::Duration;

use serde::Serialize;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    Envelope,
    event::{EnrollmentLogEvent, EventEnvelope},
    transport::Transport,
};

/// Topic names of the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTopics {
    /// Raw enrollment events.
    pub enrollment_logs: String,
    /// Email envelopes after each state change.
    pub email_events: String,
}

impl Default for LogTopics {
    fn default() -> Self {
        Self {
            enrollment_logs: "enrollment-logs".to_owned(),
            email_events: "email-events".to_owned(),
        }
    }
}

/// Routing headers of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeaders {
    pub topic: String,
    /// Partition key: the enrollment id.
    pub key: String,
    pub event_type: String,
}

/// Payload written to the log stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogRecord {
    Email(EventEnvelope),
    Enrollment(EnrollmentLogEvent),
}

/// Retry policy of the sink, independent from the publisher's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkRetry {
    pub attempts: u32,
    pub delay: Duration,
    /// Upper bound for one send.
    pub timeout: Duration,
}

impl Default for SinkRetry {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(200),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Background writer for the log stream.
pub struct LogSink<T> {
    transport: Transport<T>,
    topics: LogTopics,
    retry: SinkRetry,
    buffer: usize,
}

impl<T> LogSink<T>
where
    T: Service<Envelope<LogHeaders, LogRecord>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
{
    pub fn new(transport: Transport<T>, topics: LogTopics) -> Self {
        Self {
            transport,
            topics,
            retry: SinkRetry::default(),
            buffer: 256,
        }
    }

    pub fn with_retry(mut self, retry: SinkRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Capacity of the record buffer between handles and the writer task.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Start the writer task.
    ///
    /// The task stops when every handle is dropped, after writing what is
    /// already buffered, or when `cancel` fires, in which case buffered
    /// records are dropped with a warning.
    pub fn spawn(self, cancel: CancellationToken) -> (LogSinkHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let handle = tokio::spawn(self.run(rx, cancel));
        (LogSinkHandle { tx }, handle)
    }

    #[tracing::instrument(name = "log_sink", skip_all)]
    async fn run(mut self, mut records: mpsc::Receiver<LogRecord>, cancel: CancellationToken) {
        tracing::info!("Log sink is starting up");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = records.recv() => match record {
                    Some(record) => self.write(record, &cancel).await,
                    None => break,
                },
            }
        }

        records.close();
        while let Ok(record) = records.try_recv() {
            let headers = self.route(&record);
            tracing::warn!(
                topic = %headers.topic,
                key = %headers.key,
                "Dropping buffered log record at shutdown"
            );
        }

        tracing::info!("Log sink is shutting down");
    }

    async fn write(&mut self, record: LogRecord, cancel: &CancellationToken) {
        let headers = self.route(&record);
        let attempts = self.retry.attempts.max(1);

        for attempt in 1..=attempts {
            let envelope = Envelope {
                headers: headers.clone(),
                message: record.clone(),
            };
            match tokio::time::timeout(self.retry.timeout, self.transport.send(envelope)).await {
                Ok(Ok(())) => {
                    tracing::debug!(topic = %headers.topic, key = %headers.key, "Log record written");
                    return;
                }
                Ok(Err(error)) if error.is_encode() => {
                    tracing::warn!(topic = %headers.topic, %error, "Log record cannot be encoded, dropping");
                    return;
                }
                Ok(Err(error)) => {
                    tracing::debug!(topic = %headers.topic, attempt, %error, "Log record write failed");
                }
                Err(_) => {
                    tracing::debug!(topic = %headers.topic, attempt, "Log record write timed out");
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.retry.delay) => {}
                }
            }
        }

        tracing::warn!(
            topic = %headers.topic,
            key = %headers.key,
            attempts,
            "Dropping log record after repeated failures"
        );
    }

    fn route(&self, record: &LogRecord) -> LogHeaders {
        match record {
            LogRecord::Email(envelope) => LogHeaders {
                topic: self.topics.email_events.clone(),
                key: envelope.correlation().enrollment_id.to_string(),
                event_type: format!("EMAIL_{}", envelope.kind().name().to_uppercase()),
            },
            LogRecord::Enrollment(event) => LogHeaders {
                topic: self.topics.enrollment_logs.clone(),
                key: event.correlation.enrollment_id.to_string(),
                event_type: event.event_type.clone(),
            },
        }
    }
}

/// Non-blocking entry point to a running [`LogSink`].
#[derive(Debug, Clone)]
pub struct LogSinkHandle {
    tx: mpsc::Sender<LogRecord>,
}

impl LogSinkHandle {
    /// Mirror an email envelope to the email-events topic.
    pub fn mirror(&self, envelope: &EventEnvelope) {
        self.offer(LogRecord::Email(envelope.clone()));
    }

    /// Record a raw enrollment event on the enrollment-logs topic.
    pub fn record(&self, event: EnrollmentLogEvent) {
        self.offer(LogRecord::Enrollment(event));
    }

    fn offer(&self, record: LogRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Log sink buffer full, dropping record");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Log sink stopped, dropping record");
            }
        }
    }
}
