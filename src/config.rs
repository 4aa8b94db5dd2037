//! Environment-driven settings.
//!
//! | Variable | Default |
//! |---|---|
//! | `RABBITMQ_HOST` | `localhost` |
//! | `RABBITMQ_PORT` | `5672` |
//! | `RABBITMQ_USER` | `guest` |
//! | `RABBITMQ_PASSWORD` | `guest` |
//! | `RABBITMQ_VHOST` | `/` |
//! | `RABBITMQ_QUEUE` | `email_sent_queue` |
//! | `RABBITMQ_DEAD_LETTER_QUEUE` | unset: failed messages are requeued forever |
//! | `RABBITMQ_MAX_DELIVERIES` | `5` (only with a dead-letter queue) |
//! | `RABBITMQ_CONNECT_ATTEMPTS` | `10` |
//! | `RABBITMQ_RETRY_DELAY_MS` | `5000` |
//! | `RABBITMQ_CONNECT_TIMEOUT_MS` | `10000` |
//! | `KAFKA_BOOTSTRAP_SERVERS` | `localhost:9092` |
//! | `KAFKA_TOPIC_ENROLLMENT_LOGS` | `enrollment-logs` |
//! | `KAFKA_TOPIC_EMAIL_EVENTS` | `email-events` |
//! | `KAFKA_MESSAGE_TIMEOUT_MS` | `5000` |
//! | `EMAIL_SEND_TIMEOUT_MS` | `30000` |
//! | `CONSUMER_RESUBSCRIBE_DELAY_MS` | `5000` |

use std::{str::FromStr, time::Duration};

use crate::{
    connection::RetryPolicy,
    consumer::{ConsumerSettings, RedeliveryPolicy},
    sink::LogTopics,
};

/// All settings needed to wire the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    pub rabbitmq: RabbitMqSettings,
    pub kafka: KafkaSettings,
    pub retry: RetryPolicy,
    pub consumer: ConsumerSettings,
}

/// Broker address and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMqSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub queue: String,
}

impl RabbitMqSettings {
    /// `amqp://` URI for these settings.
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_owned()
        } else {
            self.vhost.trim_start_matches('/').to_owned()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }
}

impl Default for RabbitMqSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            queue: "email_sent_queue".to_owned(),
        }
    }
}

/// Log stream settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub topics: LogTopics,
    pub message_timeout: Duration,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_owned(),
            topics: LogTopics::default(),
            message_timeout: Duration::from_millis(5000),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for unset
    /// variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let rabbit_defaults = RabbitMqSettings::default();
        let kafka_defaults = KafkaSettings::default();
        let retry_defaults = RetryPolicy::default();
        let consumer_defaults = ConsumerSettings::default();

        let rabbitmq = RabbitMqSettings {
            host: env.string("RABBITMQ_HOST", rabbit_defaults.host),
            port: env.parse("RABBITMQ_PORT", rabbit_defaults.port)?,
            username: env.string("RABBITMQ_USER", rabbit_defaults.username),
            password: env.string("RABBITMQ_PASSWORD", rabbit_defaults.password),
            vhost: env.string("RABBITMQ_VHOST", rabbit_defaults.vhost),
            queue: env.string("RABBITMQ_QUEUE", rabbit_defaults.queue),
        };

        let kafka = KafkaSettings {
            bootstrap_servers: env.string(
                "KAFKA_BOOTSTRAP_SERVERS",
                kafka_defaults.bootstrap_servers,
            ),
            topics: LogTopics {
                enrollment_logs: env.string(
                    "KAFKA_TOPIC_ENROLLMENT_LOGS",
                    kafka_defaults.topics.enrollment_logs,
                ),
                email_events: env.string(
                    "KAFKA_TOPIC_EMAIL_EVENTS",
                    kafka_defaults.topics.email_events,
                ),
            },
            message_timeout: env.millis("KAFKA_MESSAGE_TIMEOUT_MS", kafka_defaults.message_timeout)?,
        };

        let retry = RetryPolicy {
            max_attempts: env.parse("RABBITMQ_CONNECT_ATTEMPTS", retry_defaults.max_attempts)?,
            delay: env.millis("RABBITMQ_RETRY_DELAY_MS", retry_defaults.delay)?,
            connect_timeout: env.millis(
                "RABBITMQ_CONNECT_TIMEOUT_MS",
                retry_defaults.connect_timeout,
            )?,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "RABBITMQ_CONNECT_ATTEMPTS",
                "must be at least 1",
            ));
        }

        let redelivery = match env.get("RABBITMQ_DEAD_LETTER_QUEUE") {
            Some(queue) => {
                let max_deliveries: u32 = env.parse("RABBITMQ_MAX_DELIVERIES", 5)?;
                if max_deliveries == 0 {
                    return Err(ConfigError::invalid(
                        "RABBITMQ_MAX_DELIVERIES",
                        "must be at least 1",
                    ));
                }
                RedeliveryPolicy::DeadLetter {
                    max_deliveries,
                    queue,
                }
            }
            None => RedeliveryPolicy::Unbounded,
        };

        let consumer = ConsumerSettings {
            queue: rabbitmq.queue.clone(),
            consumer_tag: consumer_defaults.consumer_tag,
            send_timeout: env.millis("EMAIL_SEND_TIMEOUT_MS", consumer_defaults.send_timeout)?,
            resubscribe_delay: env.millis(
                "CONSUMER_RESUBSCRIBE_DELAY_MS",
                consumer_defaults.resubscribe_delay,
            )?,
            redelivery,
        };

        Ok(Self {
            rabbitmq,
            kafka,
            retry,
            consumer,
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn string(&self, name: &str, default: String) -> String {
        self.get(name).unwrap_or(default)
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(name) {
            Some(_) => self.parse::<u64>(name, 0).map(Duration::from_millis),
            None => Ok(default),
        }
    }
}

/// Error returned when a variable holds an unusable value.
#[derive(Debug)]
pub struct ConfigError {
    variable: &'static str,
    reason: String,
}

impl ConfigError {
    fn invalid(variable: &'static str, reason: impl Into<String>) -> Self {
        Self {
            variable,
            reason: reason.into(),
        }
    }

    pub fn variable(&self) -> &str {
        self.variable
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid value for {}: {}", self.variable, self.reason)
    }
}

impl std::error::Error for ConfigError {}
