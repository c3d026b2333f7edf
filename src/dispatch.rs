use crate::connection::ConnectionStateCell;
use crate::frame::{decode_message, ServerMessage, SseFrame};
use crate::subscription::SubscriptionRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A raw frame tagged with the client id that was current when it was read
/// off the stream. The tag lets the dispatcher drop frames that were still
/// queued when a reconnect replaced the connection's identity.
#[derive(Debug)]
pub(crate) struct TaggedFrame {
    pub client_id: String,
    pub frame: SseFrame,
}

/// Spawn the dispatch task: decode frames coming off the connection and
/// route them to matching callbacks. Running this on its own task keeps
/// slow callbacks from stalling the stream read loop directly; they only
/// backpressure the bounded frame channel.
pub(crate) fn spawn_dispatcher(
    registry: Arc<SubscriptionRegistry>,
    state: Arc<ConnectionStateCell>,
    mut frames: mpsc::Receiver<TaggedFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tagged) = frames.recv().await {
            if state.streaming_client_id().as_deref() != Some(tagged.client_id.as_str()) {
                tracing::debug!(topic = %tagged.frame.event, "dropping frame from superseded connection");
                continue;
            }
            match decode_message(&tagged.frame) {
                Ok(ServerMessage::Change(event)) => registry.dispatch(&event),
                Ok(ServerMessage::Connect { .. }) => {}
                Err(err) => {
                    tracing::debug!(error = %err, topic = %tagged.frame.event, "undecodable event frame");
                    registry.broadcast_error(err);
                }
            }
        }
    })
}
