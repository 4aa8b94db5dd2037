use std::{io, sync::Arc};

use tokio::sync::Mutex;

use crate::{Envelope, transport::Sender};

/// In-memory sender for tests and local pipelines.
///
/// Every clone shares the same record of sent envelopes. Failures can be
/// scripted with [`fail_next`](InMemory::fail_next) to exercise retry and
/// degradation paths without a real backend.
pub struct InMemory<H, M> {
    state: Arc<Mutex<State<H, M>>>,
}

struct State<H, M> {
    sent: Vec<Envelope<H, M>>,
    failures: usize,
    attempts: usize,
}

impl<H, M> InMemory<H, M> {
    /// Drain and return the envelopes sent so far.
    pub async fn sent_messages(&self) -> Vec<Envelope<H, M>> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.sent)
    }

    /// Make the next `count` sends fail.
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.failures = count;
    }

    /// Number of send calls, successful or not.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

impl<H, M> Clone for InMemory<H, M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<H, M> Default for InMemory<H, M> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                sent: Vec::new(),
                failures: 0,
                attempts: 0,
            })),
        }
    }
}

#[async_trait::async_trait]
impl<H, M> Sender<H, M> for InMemory<H, M>
where
    H: std::fmt::Debug + Send,
    M: std::fmt::Debug + Send,
{
    type Error = io::Error;

    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted in-memory failure",
            ));
        }

        tracing::debug!(headers = ?envelope.headers, "Message recorded in memory");
        state.sent.push(envelope);
        Ok(())
    }
}
