//! Event contracts carried through the broker.
//!
//! [`EventEnvelope`] is the message published for every enrollment that needs
//! a confirmation email. It is immutable: a delivery outcome is recorded by
//! deriving a successor envelope with [`EventEnvelope::mark_sent`] or
//! [`EventEnvelope::mark_failed`], and only `Pending` envelopes can be
//! advanced.
//!
//! [`EnrollmentLogEvent`] is the raw business event mirrored to the log sink.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type recorded for a newly registered enrollment.
pub const ENROLLMENT_REGISTERED: &str = "ENROLLMENT_REGISTERED";

/// Identifiers tying an event back to the business records it describes.
///
/// All three are mandatory: routing, log partitioning and consumer-side
/// idempotency depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub enrollment_id: u64,
    pub student_id: u64,
    pub section_id: u64,
}

/// Delivery state of an [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventKind {
    /// Waiting for the confirmation email to be sent.
    Pending,
    /// The email was handed to the mail server.
    #[serde(rename_all = "camelCase")]
    Sent { sent_at: DateTime<Utc> },
    /// Delivery was abandoned.
    #[serde(rename_all = "camelCase")]
    Failed {
        failed_at: DateTime<Utc>,
        reason: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Pending => "pending",
            EventKind::Sent { .. } => "sent",
            EventKind::Failed { .. } => "failed",
        }
    }
}

/// Confirmation-email event published to the queue.
///
/// Fields are private; construct with [`EventEnvelope::pending`] and read
/// through the accessors. Decoding runs the same validation as construction,
/// so a payload with an unusable recipient fails to deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WireEnvelope")]
pub struct EventEnvelope {
    id: Uuid,
    correlation: Correlation,
    to: String,
    subject: String,
    body: String,
    created_at: DateTime<Utc>,
    status: EventKind,
}

impl EventEnvelope {
    /// Create a `Pending` envelope stamped with the current time.
    pub fn pending(
        correlation: Correlation,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        Self::pending_at(correlation, to, subject, body, Utc::now())
    }

    /// Create a `Pending` envelope with an explicit creation time.
    pub fn pending_at(
        correlation: Correlation,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        WireEnvelope {
            id: Uuid::new_v4(),
            correlation,
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            created_at,
            status: EventKind::Pending,
        }
        .try_into()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn correlation(&self) -> Correlation {
        self.correlation
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn kind(&self) -> &EventKind {
        &self.status
    }

    /// Time the email was sent, if it was.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            EventKind::Sent { sent_at } => Some(*sent_at),
            _ => None,
        }
    }

    /// Derive the `Sent` successor of a `Pending` envelope.
    pub fn mark_sent(&self, sent_at: DateTime<Utc>) -> Result<Self, TransitionError> {
        self.advance(EventKind::Sent { sent_at })
    }

    /// Derive the `Failed` successor of a `Pending` envelope.
    pub fn mark_failed(
        &self,
        reason: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Result<Self, TransitionError> {
        self.advance(EventKind::Failed {
            failed_at,
            reason: reason.into(),
        })
    }

    fn advance(&self, next: EventKind) -> Result<Self, TransitionError> {
        if self.status != EventKind::Pending {
            return Err(TransitionError {
                from: self.status.name(),
                to: next.name(),
            });
        }

        Ok(Self {
            status: next,
            ..self.clone()
        })
    }

    /// Encode as the JSON body published to the queue.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a queue message body.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    id: Uuid,
    correlation: Correlation,
    to: String,
    subject: String,
    body: String,
    created_at: DateTime<Utc>,
    status: EventKind,
}

impl TryFrom<WireEnvelope> for EventEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let to = wire.to.trim();
        if to.is_empty() || !to.contains('@') {
            return Err(EnvelopeError {
                kind: EnvelopeErrorKind::InvalidRecipient(wire.to),
            });
        }
        if wire.subject.trim().is_empty() {
            return Err(EnvelopeError {
                kind: EnvelopeErrorKind::MissingSubject,
            });
        }

        Ok(Self {
            id: wire.id,
            correlation: wire.correlation,
            to: wire.to,
            subject: wire.subject,
            body: wire.body,
            created_at: wire.created_at,
            status: wire.status,
        })
    }
}

/// Error returned when an envelope would violate the message contract.
#[derive(Debug)]
pub struct EnvelopeError {
    kind: EnvelopeErrorKind,
}

#[derive(Debug)]
enum EnvelopeErrorKind {
    InvalidRecipient(String),
    MissingSubject,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EnvelopeErrorKind::InvalidRecipient(to) => write!(f, "Invalid recipient {to:?}"),
            EnvelopeErrorKind::MissingSubject => write!(f, "Subject must not be empty"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Error returned for a state change that is not `Pending → Sent|Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    from: &'static str,
    to: &'static str,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cannot move an envelope from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Raw enrollment event mirrored to the enrollment-log topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentLogEvent {
    #[serde(flatten)]
    pub correlation: Correlation,
    pub cost: f64,
    pub payment_method: String,
    pub status: String,
    pub enrolled_on: NaiveDate,
    pub recorded_at: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
}

impl EnrollmentLogEvent {
    /// Event describing a freshly registered enrollment.
    pub fn registered(
        correlation: Correlation,
        cost: f64,
        payment_method: impl Into<String>,
        status: impl Into<String>,
        enrolled_on: NaiveDate,
    ) -> Self {
        Self {
            correlation,
            cost,
            payment_method: payment_method.into(),
            status: status.into(),
            enrolled_on,
            recorded_at: Utc::now(),
            event_type: ENROLLMENT_REGISTERED.to_owned(),
            message: format!("Enrollment {} registered", correlation.enrollment_id),
        }
    }
}
