/// ChatSync - realtime conversation synchronization engine
///
/// Keeps a client's view of conversations, messages and unread counts in sync
/// with a request API and a push channel, with optimistic local mutations.

pub mod active;
pub mod backend;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod digest;
pub mod directory;
pub mod engine;
pub mod error;
pub mod message_store;
pub mod model;
pub mod mutations;
pub mod push_token;
pub mod session;
pub mod subscriptions;
pub mod utils;

pub use backend::{ChatApi, MemoryBackend, PushRegistrar, RealtimeFeed};
pub use config::Config;
pub use engine::ChatEngine;
pub use error::{Result, SyncError};
pub use model::{DeliveryStatus, EngineEvent, Message, MessageId};
pub use session::SessionIdentity;
