//! Events delivered to the embedding application.
//!
//! The engine pushes events onto an unbounded queue and a dedicated task
//! delivers them to the application handler one at a time: each call
//! returns before the next event is delivered, and the engine itself never
//! waits on the handler. Handlers are free to call back into the engine.

use std::sync::Arc;

use alpenhorn_proto::SignedConfig;
use tokio::sync::mpsc;

use crate::{
    error::Error,
    store::{Friend, IncomingFriendRequest, OutgoingCall, OutgoingFriendRequest},
};

/// Everything the engine reports to the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// The engine hit an error the user should know about.
    Error(Error),

    /// The add-friend protocol completed; a new friend exists.
    ConfirmedFriend(Friend),

    /// An outgoing friend request went out in this round.
    SentFriendRequest(OutgoingFriendRequest),

    /// Someone sent us a friend request. The application should eventually
    /// approve or reject it through the client.
    ReceivedFriendRequest(IncomingFriendRequest),

    /// An incoming request matched one we sent, but the sender's long-term
    /// key differs from the key we expected. No friend was created and the
    /// incoming request was discarded.
    UnexpectedSigningKey {
        /// The request that arrived.
        incoming: IncomingFriendRequest,
        /// The request we had sent, with the expected key.
        outgoing: OutgoingFriendRequest,
    },

    /// An outgoing call went out in this round.
    SentCall(OutgoingCall),

    /// A friend dialed us.
    ReceivedCall {
        /// Which friend.
        username: String,
        /// Dialing round the call arrived in.
        round: u32,
        /// Caller-chosen intent slot.
        intent: u32,
    },

    /// The configuration for a protocol changed. The chain starts with the
    /// new config and ends with the previously trusted one.
    NewConfig {
        /// `"AddFriend"` or `"Dialing"`.
        service: String,
        /// Verified chain, newest first.
        chain: Vec<SignedConfig>,
    },
}

/// Application-supplied event sink.
pub trait EventHandler: Send + Sync {
    /// Handle one event. Called from a single task, in emission order.
    fn on_event(&self, event: Event);
}

/// Engine-side handle for emitting events.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Emit an event; never blocks. Events emitted after the delivery task
    /// has shut down are dropped.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Shorthand for the error event.
    pub(crate) fn error(&self, err: Error) {
        self.emit(Event::Error(err));
    }
}

/// Start the delivery task. Events queue until the returned sender is
/// dropped; queued events drain before the task exits.
pub(crate) fn start_dispatcher(
    handler: Arc<dyn EventHandler>,
) -> (EventSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handler.on_event(event);
        }
    });
    (EventSender { tx }, task)
}
