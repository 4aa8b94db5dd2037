//! Outgoing message path shared by the publisher and the log sink.
//!
//! A [`Transport`] is a thin handle over a Tower service stack ending in a
//! [`Sender`] backend:
//!
//! - [`QueueSender`]: durable broker queue through a
//!   [`ConnectionManager`](crate::connection::ConnectionManager)
//! - [`kafka::Kafka`]: topic-addressed log stream (feature `kafka`)
//! - [`InMemory`]: records envelopes, for tests and local pipelines
//!
//! Layers such as [`JsonLayer`](layers::JsonLayer) sit in between and turn
//! typed events into a [`RawPayload`].
//!
//! A send is exactly one attempt. Reconnects belong to the connection manager
//! and retries to the caller.

mod inmemory;
mod queue;

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::InMemory;
pub use queue::{QueueHeaders, QueueRoute, QueueSender};

/// Handle to a Tower service stack delivering [`Envelope`]s.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Transport ending in the `sender` backend.
    pub fn new(sender: D) -> Self {
        Self {
            service: SenderService { sender },
        }
    }
}

impl<S> Transport<S> {
    /// Wrap the current stack in `layer`.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Deliver one envelope through the stack.
    pub async fn send<H, M>(&mut self, envelope: Envelope<H, M>) -> Result<(), TransportError>
    where
        S: Service<Envelope<H, M>> + Clone,
        S::Error: Into<tower::BoxError>,
    {
        self.service
            .clone()
            .oneshot(envelope)
            .await
            .map(|_| ())
            .map_err(|error| TransportError::from_boxed(error.into()))
    }
}

/// Error returned by [`Transport::send`].
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Why a send failed.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The backend did not take the message. Another attempt may succeed.
    Backend(tower::BoxError),
    /// The message could not be encoded. Another attempt cannot succeed.
    Encode(tower::BoxError),
}

impl TransportError {
    pub fn backend(error: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Backend(error.into()))
    }

    pub fn encode(error: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Encode(error.into()))
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// Layers below may already have produced a `TransportError`; keep it.
    fn from_boxed(error: tower::BoxError) -> Self {
        match error.downcast::<TransportError>() {
            Ok(error) => *error,
            Err(error) => Self::backend(error),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Whether retrying the same message is pointless.
    pub fn is_encode(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Encode(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Backend(error) => writeln!(f, "Backend error: {error}"),
            TransportErrorKind::Encode(error) => writeln!(f, "Encode error: {error}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Backend(error) | TransportErrorKind::Encode(error) => {
                Some(error.as_ref())
            }
        }
    }
}

/// Bottom of every stack: adapts a [`Sender`] to `tower::Service`.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<H, M, D> Service<Envelope<H, M>> for SenderService<D>
where
    H: Send + 'static,
    M: Send + 'static,
    D: Sender<H, M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope<H, M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move { sender.send(envelope).await.map_err(Into::into) })
    }
}

/// A concrete backend.
#[async_trait::async_trait]
pub trait Sender<H, M> {
    type Error: Into<tower::BoxError>;

    /// Deliver an envelope. One attempt.
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error>;
}

/// Encoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RawPayload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
