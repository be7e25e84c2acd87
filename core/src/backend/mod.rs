/// Collaborator contracts consumed by the engine
///
/// `ChatApi` is the request/response API, `RealtimeFeed` the push/subscribe
/// data service and `PushRegistrar` the device token issuer.
pub mod memory;

use crate::error::Result;
use crate::model::{
    ConversationRecord, DeliveryStatus, MessagePage, MessageRecord, NotificationDigest, PageQuery,
    Role, SendRequest, UserRecord,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryBackend;

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>>;

    async fn list_users(&self) -> Result<Vec<UserRecord>>;

    async fn fetch_messages(&self, conversation_id: &str, query: &PageQuery) -> Result<MessagePage>;

    async fn send_message(&self, request: SendRequest) -> Result<MessageRecord>;

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<MessageRecord>;

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()>;

    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()>;

    async fn remove_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()>;

    async fn add_participant(&self, conversation_id: &str, user_id: &str) -> Result<()>;

    async fn remove_participant(&self, conversation_id: &str, user_id: &str) -> Result<()>;

    async fn change_role(&self, user_id: &str, role: Role) -> Result<()>;

    /// Batched receipt update for a list of message ids
    async fn update_receipts(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        status: DeliveryStatus,
    ) -> Result<()>;

    async fn mark_conversation_read(&self, user_id: &str, conversation_id: &str) -> Result<()>;

    async fn fetch_notifications(&self, user_id: &str) -> Result<Vec<NotificationDigest>>;
}

/// One delivery on a push channel
#[derive(Debug, Clone)]
pub enum FeedEvent<T> {
    /// Complete, ordered snapshot of the channel's current state
    Snapshot(Vec<T>),
    /// Channel-level error; the channel stays open
    Error(String),
}

pub type Teardown = Box<dyn FnOnce() + Send + Sync>;

/// Live push channel: events arrive on `events` until `teardown` is called
/// or the sender side closes
pub struct FeedSubscription<T> {
    pub events: mpsc::UnboundedReceiver<FeedEvent<T>>,
    pub teardown: Teardown,
}

#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    fn subscribe_messages(&self, conversation_id: &str) -> Result<FeedSubscription<MessageRecord>>;

    fn subscribe_digest(&self, user_id: &str) -> Result<FeedSubscription<NotificationDigest>>;

    /// "Active in conversation" presence flag
    async fn set_presence(&self, user_id: &str, conversation_id: &str, active: bool) -> Result<()>;
}

#[async_trait]
pub trait PushRegistrar: Send + Sync {
    async fn register_token(&self, user_id: &str) -> Result<String>;

    async fn unregister_token(&self, token: &str) -> Result<()>;
}
