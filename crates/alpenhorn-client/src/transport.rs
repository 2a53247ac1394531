//! The typed-envelope websocket channel to the coordinator.
//!
//! A thin layer: JSON envelopes in, JSON envelopes out. All protocol logic
//! stays in the engine; this module only bridges a websocket to an
//! envelope channel, the way the engine's tests bridge an in-memory queue.
//! Server identity pinning is the TLS layer's concern and out of scope
//! here.

use std::sync::Mutex;

use alpenhorn_proto::Envelope;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::Error;

/// The sending half of an envelope channel.
pub trait ConnSink: Send + Sync {
    /// Queue an envelope for the coordinator. Never blocks.
    fn send(&self, envelope: Envelope) -> Result<(), Error>;
}

/// A live websocket connection to one coordinator endpoint.
pub struct WsConn {
    outgoing: mpsc::UnboundedSender<Envelope>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConnSink for WsConn {
    fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.outgoing
            .send(envelope)
            .map_err(|_| Error::Transport("coordinator connection closed".to_string()))
    }
}

impl WsConn {
    /// Abort the reader and writer tasks.
    pub fn close(&self) {
        // See ConfigVerifier::cached for the poisoning policy.
        #[allow(clippy::expect_used)]
        for task in self.tasks.lock().expect("transport lock poisoned").drain(..) {
            task.abort();
        }
    }
}

/// Dial a coordinator websocket endpoint.
///
/// Envelopes read from the socket go to `incoming`; envelopes passed to
/// the returned sink go to the socket. Either direction failing tears the
/// connection down; the engine treats a torn connection as a lost round
/// and keeps going when redialed.
pub async fn dial(
    url: &str,
    incoming: mpsc::UnboundedSender<Envelope>,
) -> Result<WsConn, Error> {
    let (ws, _response) =
        connect_async(url).await.map_err(|e| Error::Transport(e.to_string()))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Envelope>();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outgoing_rx.recv().await {
            let bytes = match envelope.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode outgoing envelope");
                    continue;
                },
            };
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if let Err(err) = ws_tx.send(Message::Text(text.into())).await {
                tracing::warn!(error = %err, "coordinator write failed");
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            let data = match message {
                Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(Message::Binary(bytes)) => bytes.to_vec(),
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "coordinator read failed");
                    break;
                },
            };
            match Envelope::decode(&data) {
                Ok(envelope) => {
                    if incoming.send(envelope).is_err() {
                        break;
                    }
                },
                Err(err) => {
                    tracing::debug!(error = %err, "dropping malformed envelope");
                },
            }
        }
    });

    Ok(WsConn { outgoing, tasks: Mutex::new(vec![writer, reader]) })
}
