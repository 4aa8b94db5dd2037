//! Boundary to the mail delivery collaborator.
//!
//! The consumer only knows the [`EmailSender`] trait. SMTP details live in the
//! implementation supplied by the application.

use std::time::Duration;

/// Sends a single email.
///
/// Implementations classify failures with [`SendError::transient`] or
/// [`SendError::permanent`] so the consumer can decide between redelivery and
/// dead-lettering.
#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError>;
}

#[async_trait::async_trait]
impl<T> EmailSender for std::sync::Arc<T>
where
    T: EmailSender + ?Sized,
{
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SendError> {
        (**self).send(to, subject, body).await
    }
}

/// Error returned by an [`EmailSender`].
#[derive(Debug)]
pub struct SendError {
    kind: SendErrorKind,
    source: tower::BoxError,
}

/// Whether retrying the send can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Timeouts, refused connections, throttling.
    Transient,
    /// Rejected recipients, malformed messages.
    Permanent,
}

impl SendError {
    pub fn transient(err: impl Into<tower::BoxError>) -> Self {
        Self {
            kind: SendErrorKind::Transient,
            source: err.into(),
        }
    }

    pub fn permanent(err: impl Into<tower::BoxError>) -> Self {
        Self {
            kind: SendErrorKind::Permanent,
            source: err.into(),
        }
    }

    pub(crate) fn timed_out(after: Duration) -> Self {
        Self::transient(format!("send timed out after {after:?}"))
    }

    pub fn kind(&self) -> SendErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SendErrorKind::Transient
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SendErrorKind::Transient => write!(f, "Transient send error: {}", self.source),
            SendErrorKind::Permanent => write!(f, "Permanent send error: {}", self.source),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
