/// Event emitter for engine observers
use crate::model::EngineEvent;
use tokio::sync::broadcast;
use tracing::trace;

pub struct EventEmitter {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget; having no observers is not an error
    pub fn emit(&self, event: EngineEvent) {
        trace!("Engine event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
