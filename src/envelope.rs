/// Transport container pairing routing headers with a payload.
///
/// Every layer of the [`transport`](crate::transport) stack passes an
/// `Envelope` down to the next one. Headers carry routing data (destination
/// queue, log topic, partition key, retry count) while the payload is either a
/// typed event or, below the [`JsonLayer`](crate::transport::layers::JsonLayer),
/// the serialized bytes.
///
/// ```rust
/// use mailchute::Envelope;
///
/// let envelope = Envelope {
///     headers: "email_sent_queue",
///     message: 42,
/// };
///
/// let bytes = envelope.map_message(|n| n.to_string().into_bytes());
/// assert_eq!(bytes.message, b"42".to_vec());
///
/// // or, from a tuple
/// let envelope: Envelope<_, _> = ("email_sent_queue", 42).into();
/// assert_eq!(envelope.headers, "email_sent_queue");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Routing metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> Envelope<H, M> {
    /// Replace the payload while keeping the headers.
    pub fn map_message<M2>(self, f: impl FnOnce(M) -> M2) -> Envelope<H, M2> {
        Envelope {
            headers: self.headers,
            message: f(self.message),
        }
    }

    /// Fallible variant of [`map_message`](Envelope::map_message).
    pub fn try_map_message<M2, E>(
        self,
        f: impl FnOnce(M) -> Result<M2, E>,
    ) -> Result<Envelope<H, M2>, E> {
        Ok(Envelope {
            headers: self.headers,
            message: f(self.message)?,
        })
    }
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}
