//! Event collection helpers

use batch_enrich::Event;
use tokio::sync::broadcast::{self, error::TryRecvError};

/// Drain every event currently buffered in `events`
///
/// Lagged receivers skip what they missed and keep draining.
pub fn drain_events(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => collected.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    collected
}

/// `completed` counts of every `CheckpointWritten` event
pub fn checkpoint_counts(events: &[Event]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::CheckpointWritten { completed, .. } => Some(*completed),
            _ => None,
        })
        .collect()
}
