//! Enrollments in, confirmation emails out.
//!
//! Runs against an in-memory broker and log stream by default. Enable the
//! `rabbitmq` and `kafka` features to talk to real backends configured from
//! the environment (a `.env` file is honored).

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use mailchute::{
    ConnectionManager, Consumer, Correlation, EmailSender, EnrollmentLogEvent, EventEnvelope,
    LogSink, LogSinkHandle, Publisher, PublisherHandle, SendError,
    broker::{Connector, Role},
    config::Settings,
    transport::{Transport, layers::JsonLayer},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

struct LoggingSender;

#[async_trait::async_trait]
impl EmailSender for LoggingSender {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), SendError> {
        tracing::info!(to, subject, "Email sent");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let settings = Settings::from_env()?;

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Failed to install Ctrl+C handler");
        }
        cancel_signal.cancel();
    });

    let (sink, sink_task) = log_sink(&settings, cancel.clone())?;

    #[cfg(feature = "rabbitmq")]
    let connector = mailchute::broker::rabbitmq::RabbitMq::from_settings(&settings.rabbitmq);
    #[cfg(not(feature = "rabbitmq"))]
    let connector = mailchute::broker::InMemoryBroker::new();

    relay(connector, &settings, sink, cancel).await;
    sink_task.await?;
    Ok(())
}

async fn relay<C: Connector + Clone>(
    connector: C,
    settings: &Settings,
    sink: LogSinkHandle,
    cancel: CancellationToken,
) {
    let queue = settings.rabbitmq.queue.clone();
    let publish = ConnectionManager::new(connector.clone(), Role::Publish, settings.retry)
        .declare_queue(&queue)
        .with_cancellation(&cancel);
    let consume = ConnectionManager::new(connector, Role::Consume, settings.retry)
        .declare_queue(&queue)
        .with_cancellation(&cancel);

    let (publisher, publisher_task) =
        Publisher::for_queue(Arc::new(publish), queue).spawn(cancel.clone());
    let consumer = Consumer::new(Arc::new(consume), LoggingSender, settings.consumer.clone())
        .with_log_sink(sink.clone());
    let consumer_task = tokio::spawn(consumer.run(cancel.clone()));

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let mut enrollment_id = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                enrollment_id += 1;
                enroll(&publisher, &sink, enrollment_id);
            }
        }
    }

    if let Err(error) = tokio::try_join!(publisher_task, consumer_task) {
        tracing::error!(%error, "Worker task failed");
    }
}

fn enroll(publisher: &PublisherHandle, sink: &LogSinkHandle, enrollment_id: u64) {
    let correlation = Correlation {
        enrollment_id,
        student_id: 1000 + enrollment_id,
        section_id: 42,
    };
    sink.record(EnrollmentLogEvent::registered(
        correlation,
        150.0,
        "card",
        "PENDING",
        Utc::now().date_naive(),
    ));

    let envelope = EventEnvelope::pending(
        correlation,
        format!("student{enrollment_id}@example.com"),
        "Enrollment confirmed",
        format!("Your enrollment #{enrollment_id} is registered."),
    );
    match envelope {
        Ok(envelope) => {
            let outcome = publisher.publish(envelope);
            tracing::info!(enrollment_id, ?outcome, "Enrollment registered");
        }
        Err(error) => tracing::error!(%error, "Invalid email envelope"),
    }
}

#[cfg(feature = "kafka")]
fn log_sink(
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<(LogSinkHandle, JoinHandle<()>), Box<dyn std::error::Error>> {
    let kafka = mailchute::transport::kafka::Kafka::from_settings(&settings.kafka)?;
    let transport = Transport::new(kafka).layer(JsonLayer);
    Ok(LogSink::new(transport, settings.kafka.topics.clone()).spawn(cancel))
}

#[cfg(not(feature = "kafka"))]
fn log_sink(
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<(LogSinkHandle, JoinHandle<()>), Box<dyn std::error::Error>> {
    use mailchute::{
        sink::LogHeaders,
        transport::{InMemory, RawPayload},
    };

    let memory: InMemory<LogHeaders, RawPayload> = InMemory::default();
    let transport = Transport::new(memory).layer(JsonLayer);
    Ok(LogSink::new(transport, settings.kafka.topics.clone()).spawn(cancel))
}
