//! Pub/sub subscriptions

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Messages buffered per subscription before the forwarder waits
pub(crate) const SUBSCRIPTION_BUFFER: usize = 1024;

/// A live subscription to one channel.
///
/// Messages are pushed by a forwarding task owned by the subscription. The
/// stream never ends on its own; [`Subscription::unsubscribe`] stops the
/// forwarder and waits for it. Dropping the subscription stops the
/// forwarder without waiting.
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<String>,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: impl Into<String>,
        receiver: mpsc::Receiver<String>,
        cancel: CancellationToken,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            cancel,
            forwarder: Some(forwarder),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Wait for the next message for at most `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take a message if one is already buffered
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving and wait for the forwarding task to finish
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(forwarder) = self.forwarder.take()
            && let Err(e) = forwarder.await
        {
            debug!(channel = %self.channel, error = %e, "Subscription forwarder ended abnormally");
        }
        debug!(channel = %self.channel, "Unsubscribed");
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &!self.cancel.is_cancelled())
            .finish()
    }
}
