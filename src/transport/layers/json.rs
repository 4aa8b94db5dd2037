use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Layer, Service};

use crate::{
    Envelope,
    transport::{RawPayload, TransportError},
};

/// Encodes the message of every envelope as JSON before handing it down.
///
/// Encoding failures surface as [`TransportError`]s of kind `Encode`, so the
/// caller can tell a message that will never go through from a backend that
/// is down for now.
#[derive(Clone)]
pub struct JsonService<S> {
    inner: S,
}

impl<S, H, M> Service<Envelope<H, M>> for JsonService<S>
where
    H: Send + 'static,
    M: serde::Serialize + Send + 'static,
    S: Service<Envelope<H, RawPayload>> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, tower::BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, envelope: Envelope<H, M>) -> Self::Future {
        // the clone is not ready yet; keep the one poll_ready was called on
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let encoded = envelope.try_map_message(|message| {
            serde_json::to_vec(&message)
                .map(RawPayload::from)
                .map_err(TransportError::encode)
        });

        Box::pin(async move {
            let envelope = encoded?;
            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Wraps a stack in a [`JsonService`].
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JsonService { inner }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::transport::{InMemory, Transport};

    #[tokio::test]
    async fn messages_are_encoded_before_the_sender() {
        let sink: InMemory<&'static str, RawPayload> = InMemory::default();
        let mut transport = Transport::new(sink.clone()).layer(JsonLayer);

        transport
            .send(Envelope {
                headers: "email-events",
                message: serde_json::json!({ "enrollmentId": 7 }),
            })
            .await
            .unwrap();

        let sent = sink.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.clone().into_inner(), br#"{"enrollmentId":7}"#.to_vec());
    }

    #[tokio::test]
    async fn encoding_failures_are_reported_as_encode_errors() {
        let sink: InMemory<&'static str, RawPayload> = InMemory::default();
        let mut transport = Transport::new(sink.clone()).layer(JsonLayer);

        // JSON object keys must be strings.
        let mut message = BTreeMap::new();
        message.insert(vec![1u8], "value");

        let err = transport
            .send(Envelope {
                headers: "email-events",
                message,
            })
            .await
            .unwrap_err();

        assert!(err.is_encode());
        assert!(sink.sent_messages().await.is_empty());
    }
}
