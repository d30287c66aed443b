//! Event plumbing: the boundary broadcast hub and the job event emitter.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};
use vpair_models::{BoundaryEvent, JobEvent};

/// Buffered boundary events per subscriber before lagging ones start losing events.
const HUB_CAPACITY: usize = 256;

/// Broadcasts boundary events to whoever is listening (CLI printer, UI bridge).
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<BoundaryEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: BoundaryEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!("No boundary subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoundaryEvent> {
        self.sender.subscribe()
    }
}

/// Non-blocking sender of job events.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: mpsc::UnboundedSender<JobEvent>,
}

impl EventEmitter {
    pub fn new(sender: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { sender }
    }

    /// Send an event. A dropped receiver is not an error for the job.
    pub fn emit(&self, event: JobEvent) {
        let kind = event.as_str();
        if self.sender.send(event).is_err() {
            debug!(event = kind, "Job event dropped: receiver closed");
        }
    }
}
