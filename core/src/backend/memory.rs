/// In-process loopback backend
///
/// Implements every collaborator contract over plain in-memory state. Each
/// operation can be made to fail (`fail`) or held in flight (`hold`/`release`)
/// so callers can exercise out-of-order completion deterministically.
use super::{ChatApi, FeedEvent, FeedSubscription, PushRegistrar, RealtimeFeed};
use crate::error::{Result, SyncError};
use crate::model::{
    ConversationId, ConversationRecord, DeliveryStatus, LastMessage, MessagePage, MessageRecord,
    NotificationDigest, PageQuery, ReactionRecord, Role, SendRequest, UserId, UserRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

type Senders<T> = Vec<(u64, mpsc::UnboundedSender<FeedEvent<T>>)>;

#[derive(Default)]
struct Inner {
    conversations: Vec<ConversationRecord>,
    users: Vec<UserRecord>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
    notifications: HashMap<UserId, Vec<NotificationDigest>>,
    message_feeds: HashMap<ConversationId, Senders<MessageRecord>>,
    digest_feeds: HashMap<UserId, Senders<NotificationDigest>>,
    presence: Vec<(UserId, ConversationId, bool)>,
    receipts: Vec<(ConversationId, Vec<String>, DeliveryStatus)>,
    read_marks: Vec<(UserId, ConversationId)>,
    tokens: HashMap<String, UserId>,
    calls: HashMap<&'static str, usize>,
    failing: HashMap<&'static str, SyncError>,
    echo_sends: bool,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    gates: Arc<Mutex<HashMap<&'static str, Arc<Semaphore>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Count the call and apply any injected failure
    fn enter(&self, op: &'static str) -> Result<()> {
        let mut s = self.state();
        *s.calls.entry(op).or_insert(0) += 1;
        match s.failing.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Wait for a permit if `op` is currently held
    async fn gate(&self, op: &'static str) {
        let gate = lock(&self.gates).get(op).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    // ─── Seeding ─────────────────────────────────────────────────────────────

    pub fn add_user(&self, id: &str, first_name: &str, last_name: &str, role: Role) {
        self.state().users.push(UserRecord {
            id: id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: format!("{}@example.com", id),
            role: Some(role.as_wire().to_string()),
            online: Some(false),
        });
    }

    pub fn add_conversation(&self, id: &str, name: Option<&str>, is_group: bool, participants: &[&str]) {
        self.state().conversations.push(ConversationRecord {
            id: id.to_string(),
            name: name.map(str::to_string),
            is_group,
            participant_ids: participants.iter().map(|p| p.to_string()).collect(),
            last_message: None,
        });
    }

    /// Store a message as if another client had sent it
    pub fn seed_message(&self, conversation_id: &str, sender_id: &str, content: &str) -> MessageRecord {
        let mut s = self.state();
        s.next_id += 1;
        let record = MessageRecord {
            id: format!("msg-{}", s.next_id),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            status: Some(DeliveryStatus::Delivered),
            parent_id: None,
            mentions: Vec::new(),
            reactions: Vec::new(),
            edited: false,
            can_delete: None,
            can_edit: None,
            client_ref: None,
        };
        s.messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    pub fn set_notifications(&self, user_id: &str, digests: Vec<NotificationDigest>) {
        self.state().notifications.insert(user_id.to_string(), digests);
    }

    /// Push the stored message list to live feeds right after every send/edit
    pub fn set_echo_sends(&self, echo: bool) {
        self.state().echo_sends = echo;
    }

    // ─── Fault injection & gating ────────────────────────────────────────────

    pub fn fail(&self, op: &'static str, err: SyncError) {
        self.state().failing.insert(op, err);
    }

    pub fn recover(&self, op: &'static str) {
        self.state().failing.remove(op);
    }

    /// Hold every future call of `op` until permits are released
    pub fn hold(&self, op: &'static str) {
        lock(&self.gates).insert(op, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: &'static str, n: usize) {
        if let Some(gate) = lock(&self.gates).get(op) {
            gate.add_permits(n);
        }
    }

    /// Stop holding `op` and let every waiter through
    pub fn open(&self, op: &'static str) {
        if let Some(gate) = lock(&self.gates).remove(op) {
            gate.close();
        }
    }

    // ─── Push side ───────────────────────────────────────────────────────────

    /// Deliver the full stored message list to every live feed of a conversation
    pub fn push_snapshot(&self, conversation_id: &str) -> usize {
        let mut s = self.state();
        Self::broadcast_snapshot(&mut s, conversation_id)
    }

    fn broadcast_snapshot(s: &mut Inner, conversation_id: &str) -> usize {
        let snapshot = s.messages.get(conversation_id).cloned().unwrap_or_default();
        let Some(feeds) = s.message_feeds.get_mut(conversation_id) else {
            return 0;
        };
        feeds.retain(|(_, tx)| tx.send(FeedEvent::Snapshot(snapshot.clone())).is_ok());
        debug!("Loopback snapshot for {} delivered to {} feeds", conversation_id, feeds.len());
        feeds.len()
    }

    pub fn push_digest(&self, user_id: &str, digests: Vec<NotificationDigest>) -> usize {
        let mut s = self.state();
        let Some(feeds) = s.digest_feeds.get_mut(user_id) else {
            return 0;
        };
        feeds.retain(|(_, tx)| tx.send(FeedEvent::Snapshot(digests.clone())).is_ok());
        feeds.len()
    }

    pub fn push_feed_error(&self, conversation_id: &str, error: &str) {
        let mut s = self.state();
        if let Some(feeds) = s.message_feeds.get_mut(conversation_id) {
            feeds.retain(|(_, tx)| tx.send(FeedEvent::Error(error.to_string())).is_ok());
        }
    }

    /// Simulate the channel dropping on the server side
    pub fn close_message_feeds(&self, conversation_id: &str) {
        self.state().message_feeds.remove(conversation_id);
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn open_message_feeds(&self, conversation_id: &str) -> usize {
        self.state()
            .message_feeds
            .get(conversation_id)
            .map(|f| f.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn open_digest_feeds(&self, user_id: &str) -> usize {
        self.state()
            .digest_feeds
            .get(user_id)
            .map(|f| f.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn stored_messages(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.state().messages.get(conversation_id).cloned().unwrap_or_default()
    }

    pub fn receipts(&self) -> Vec<(ConversationId, Vec<String>, DeliveryStatus)> {
        self.state().receipts.clone()
    }

    pub fn read_marks(&self) -> Vec<(UserId, ConversationId)> {
        self.state().read_marks.clone()
    }

    pub fn presence_log(&self) -> Vec<(UserId, ConversationId, bool)> {
        self.state().presence.clone()
    }

    pub fn registered_tokens(&self) -> usize {
        self.state().tokens.len()
    }

    fn find_message<'a>(s: &'a mut Inner, message_id: &str) -> Option<&'a mut MessageRecord> {
        s.messages
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|m| m.id == message_id)
    }

    fn next_feed_id(s: &mut Inner) -> u64 {
        s.next_id += 1;
        s.next_id
    }
}

#[async_trait]
impl ChatApi for MemoryBackend {
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        self.enter("list_conversations")?;
        self.gate("list_conversations").await;
        Ok(self.state().conversations.clone())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.enter("list_users")?;
        self.gate("list_users").await;
        Ok(self.state().users.clone())
    }

    async fn fetch_messages(&self, conversation_id: &str, query: &PageQuery) -> Result<MessagePage> {
        self.enter("fetch_messages")?;
        self.gate("fetch_messages").await;

        let all = self.stored_messages(conversation_id);
        let needle = query.search.as_deref().map(str::to_lowercase);
        let matching: Vec<MessageRecord> = all
            .into_iter()
            .filter(|m| match &needle {
                Some(n) => m.content.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .collect();

        let total_count = matching.len();
        let page_size = if query.page_size == 0 {
            total_count.max(1)
        } else {
            query.page_size as usize
        };
        let total_pages = total_count.div_ceil(page_size);

        // Page 0 is the newest slice; items stay chronological inside a page
        let end = total_count.saturating_sub(query.page_index as usize * page_size);
        let start = end.saturating_sub(page_size);
        Ok(MessagePage {
            content: matching[start..end].to_vec(),
            page_index: query.page_index,
            total_pages: total_pages as u32,
            total_count: total_count as u64,
        })
    }

    async fn send_message(&self, request: SendRequest) -> Result<MessageRecord> {
        self.enter("send_message")?;
        if request.content.trim().is_empty() {
            return Err(SyncError::Validation("message content is empty".to_string()));
        }

        let record = {
            let mut s = self.state();
            s.next_id += 1;
            let record = MessageRecord {
                id: format!("msg-{}", s.next_id),
                conversation_id: request.conversation_id.clone(),
                sender_id: request.sender_id,
                content: request.content,
                created_at: Utc::now(),
                status: Some(DeliveryStatus::Sent),
                parent_id: request.parent_id,
                mentions: request.mentions,
                reactions: Vec::new(),
                edited: false,
                can_delete: None,
                can_edit: None,
                client_ref: Some(request.client_ref.clone()),
            };
            if let Some(conv) = s
                .conversations
                .iter_mut()
                .find(|c| c.id == request.conversation_id)
            {
                conv.last_message = Some(LastMessage {
                    sender_id: record.sender_id.clone(),
                    content: record.content.clone(),
                    at: record.created_at,
                });
            }
            s.messages
                .entry(request.conversation_id.clone())
                .or_default()
                .push(record.clone());
            if s.echo_sends {
                Self::broadcast_snapshot(&mut s, &request.conversation_id);
            }
            record
        };

        self.gate("send_message").await;
        Ok(record)
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<MessageRecord> {
        self.enter("edit_message")?;
        self.gate("edit_message").await;
        let mut s = self.state();
        let record = {
            let msg = Self::find_message(&mut s, message_id)
                .ok_or_else(|| SyncError::NotFound(format!("message {}", message_id)))?;
            msg.content = content.to_string();
            msg.edited = true;
            msg.clone()
        };
        if s.echo_sends {
            Self::broadcast_snapshot(&mut s, conversation_id);
        }
        Ok(record)
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.enter("delete_message")?;
        self.gate("delete_message").await;
        let mut s = self.state();
        let list = s.messages.entry(conversation_id.to_string()).or_default();
        let before = list.len();
        list.retain(|m| m.id != message_id);
        if list.len() == before {
            return Err(SyncError::NotFound(format!("message {}", message_id)));
        }
        Ok(())
    }

    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()> {
        self.enter("add_reaction")?;
        self.gate("add_reaction").await;
        let mut s = self.state();
        let msg = Self::find_message(&mut s, message_id)
            .ok_or_else(|| SyncError::NotFound(format!("message {}", message_id)))?;
        match msg.reactions.iter_mut().find(|r| r.emoji == emoji) {
            Some(r) if !r.user_ids.iter().any(|u| u == user_id) => r.user_ids.push(user_id.to_string()),
            Some(_) => {}
            None => msg.reactions.push(ReactionRecord {
                emoji: emoji.to_string(),
                user_ids: vec![user_id.to_string()],
            }),
        }
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()> {
        self.enter("remove_reaction")?;
        self.gate("remove_reaction").await;
        let mut s = self.state();
        let msg = Self::find_message(&mut s, message_id)
            .ok_or_else(|| SyncError::NotFound(format!("message {}", message_id)))?;
        for r in msg.reactions.iter_mut().filter(|r| r.emoji == emoji) {
            r.user_ids.retain(|u| u != user_id);
        }
        msg.reactions.retain(|r| !r.user_ids.is_empty());
        Ok(())
    }

    async fn add_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.enter("add_participant")?;
        let mut s = self.state();
        let conv = s
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {}", conversation_id)))?;
        if !conv.participant_ids.iter().any(|p| p == user_id) {
            conv.participant_ids.push(user_id.to_string());
        }
        Ok(())
    }

    async fn remove_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.enter("remove_participant")?;
        let mut s = self.state();
        let conv = s
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {}", conversation_id)))?;
        conv.participant_ids.retain(|p| p != user_id);
        Ok(())
    }

    async fn change_role(&self, user_id: &str, role: Role) -> Result<()> {
        self.enter("change_role")?;
        let mut s = self.state();
        let user = s
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| SyncError::NotFound(format!("user {}", user_id)))?;
        user.role = Some(role.as_wire().to_string());
        Ok(())
    }

    async fn update_receipts(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        status: DeliveryStatus,
    ) -> Result<()> {
        self.enter("update_receipts")?;
        let mut s = self.state();
        if let Some(list) = s.messages.get_mut(conversation_id) {
            for m in list.iter_mut().filter(|m| message_ids.contains(&m.id)) {
                m.status = Some(status);
            }
        }
        s.receipts
            .push((conversation_id.to_string(), message_ids.to_vec(), status));
        Ok(())
    }

    async fn mark_conversation_read(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        self.enter("mark_conversation_read")?;
        self.gate("mark_conversation_read").await;
        let mut s = self.state();
        s.read_marks
            .push((user_id.to_string(), conversation_id.to_string()));
        if let Some(list) = s.notifications.get_mut(user_id) {
            for d in list.iter_mut().filter(|d| d.conversation_id == conversation_id) {
                d.unread = 0;
                d.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn fetch_notifications(&self, user_id: &str) -> Result<Vec<NotificationDigest>> {
        self.enter("fetch_notifications")?;
        self.gate("fetch_notifications").await;
        Ok(self
            .state()
            .notifications
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RealtimeFeed for MemoryBackend {
    fn subscribe_messages(&self, conversation_id: &str) -> Result<FeedSubscription<MessageRecord>> {
        self.enter("subscribe_messages")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut s = self.state();
            let id = Self::next_feed_id(&mut s);
            s.message_feeds
                .entry(conversation_id.to_string())
                .or_default()
                .push((id, tx));
            id
        };

        let inner = self.inner.clone();
        let key = conversation_id.to_string();
        Ok(FeedSubscription {
            events: rx,
            teardown: Box::new(move || {
                if let Some(feeds) = lock(&inner).message_feeds.get_mut(&key) {
                    feeds.retain(|(feed_id, _)| *feed_id != id);
                }
            }),
        })
    }

    fn subscribe_digest(&self, user_id: &str) -> Result<FeedSubscription<NotificationDigest>> {
        self.enter("subscribe_digest")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut s = self.state();
            let id = Self::next_feed_id(&mut s);
            s.digest_feeds
                .entry(user_id.to_string())
                .or_default()
                .push((id, tx));
            id
        };

        let inner = self.inner.clone();
        let key = user_id.to_string();
        Ok(FeedSubscription {
            events: rx,
            teardown: Box::new(move || {
                if let Some(feeds) = lock(&inner).digest_feeds.get_mut(&key) {
                    feeds.retain(|(feed_id, _)| *feed_id != id);
                }
            }),
        })
    }

    async fn set_presence(&self, user_id: &str, conversation_id: &str, active: bool) -> Result<()> {
        self.enter("set_presence")?;
        self.state()
            .presence
            .push((user_id.to_string(), conversation_id.to_string(), active));
        Ok(())
    }
}

#[async_trait]
impl PushRegistrar for MemoryBackend {
    async fn register_token(&self, user_id: &str) -> Result<String> {
        self.enter("register_token")?;
        self.gate("register_token").await;
        let token = format!("tok-{}", uuid::Uuid::new_v4());
        self.state().tokens.insert(token.clone(), user_id.to_string());
        Ok(token)
    }

    async fn unregister_token(&self, token: &str) -> Result<()> {
        self.enter("unregister_token")?;
        self.state().tokens.remove(token);
        Ok(())
    }
}
