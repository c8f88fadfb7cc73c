//! Request/reply over an actor's inbound channel

use crate::{Result, TransportError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Send a message carrying a reply channel and wait for the reply
///
/// Without a timeout this waits as long as the receiver keeps the reply
/// channel alive.
pub async fn request<M, R>(
    sender: &mpsc::UnboundedSender<M>,
    make: impl FnOnce(oneshot::Sender<R>) -> M,
    timeout: Option<Duration>,
) -> Result<R> {
    let (reply_tx, reply_rx) = oneshot::channel();
    sender
        .send(make(reply_tx))
        .map_err(|_| TransportError::ChannelClosed("request channel".into()))?;

    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::ReplyDropped),
            Err(_) => Err(TransportError::Timeout),
        },
        None => reply_rx.await.map_err(|_| TransportError::ReplyDropped),
    }
}
