pub mod cooldown;
pub mod event_emitter;

pub use cooldown::within;
pub use event_emitter::EventEmitter;
