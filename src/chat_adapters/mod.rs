pub mod twitch;
pub mod youtube;

use crate::models::ChatEvent;
use tokio::sync::mpsc;

/// Events flow from an adapter to the orchestrator over an unbounded channel; a
/// bounded channel would require choosing a drop policy that belongs to the
/// orchestrator, not the adapter.
pub type EventSender = mpsc::UnboundedSender<ChatEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
