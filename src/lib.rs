#![doc = include_str!("../README.md")]

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod email;
pub mod envelope;
pub mod event;
pub mod publisher;
pub mod sink;
pub mod transport;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use event::{Correlation, EnrollmentLogEvent, EventEnvelope, EventKind};

#[doc(inline)]
pub use connection::{ConnectionError, ConnectionManager, ConnectionState, RetryPolicy};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use publisher::{DefaultPublisherHook, PublishOutcome, Publisher, PublisherHandle, PublisherHook};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerHook, ConsumerSettings, DeadLetter, DefaultConsumerHook, RedeliveryPolicy,
};

#[doc(inline)]
pub use email::{EmailSender, SendError, SendErrorKind};

#[doc(inline)]
pub use sink::{LogSink, LogSinkHandle, LogTopics, SinkRetry};
