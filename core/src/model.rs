/// Domain entities, wire records and engine events
use crate::session::SessionIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use crate::session::UserId;

pub type ConversationId = String;

// ─── Directory entities ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw.map(|r| r.to_ascii_lowercase()) {
            Some(r) if r == "admin" || r == "owner" => Role::Admin,
            _ => Role::Member,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

/// Best-effort presence; never assumed consistent with the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Away,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub label: String,
    pub role: Role,
    pub presence: Presence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub sender_id: UserId,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// For direct conversations this is the other participant's label
    pub name: String,
    pub kind: ConversationKind,
    pub participants: Vec<UserId>,
    pub last_message: Option<LastMessage>,
    /// Derived from the digest aggregator; never authoritative on its own
    pub unread_count: u32,
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Client-generated until the server confirms it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Temp(String),
    Server(String),
}

impl MessageId {
    pub fn new_temp() -> Self {
        MessageId::Temp(format!("temp-{}", uuid::Uuid::new_v4()))
    }

    pub fn server(id: impl Into<String>) -> Self {
        MessageId::Server(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Temp(id) | MessageId::Server(id) => id,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, MessageId::Temp(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// Count is the number of distinct reactors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub reactors: BTreeSet<UserId>,
}

impl Reaction {
    pub fn count(&self) -> usize {
        self.reactors.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub deletable: bool,
    pub editable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub parent_id: Option<String>,
    pub mentions: Vec<UserId>,
    pub reactions: Vec<Reaction>,
    pub capabilities: Capabilities,
    pub edited: bool,
    /// Correlation key echoed back by the server (the temp id used on send)
    pub client_ref: Option<String>,
}

impl Message {
    /// Local placeholder inserted by an optimistic send
    pub fn pending(
        session: &SessionIdentity,
        conversation_id: &str,
        content: String,
        mentions: Vec<UserId>,
        parent_id: Option<String>,
    ) -> Self {
        let id = MessageId::new_temp();
        Self {
            client_ref: Some(id.as_str().to_string()),
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: session.user_id.clone(),
            content,
            created_at: Utc::now(),
            status: DeliveryStatus::Sending,
            parent_id,
            mentions,
            reactions: Vec::new(),
            capabilities: Capabilities {
                deletable: true,
                editable: true,
            },
            edited: false,
        }
    }

    pub fn from_record(record: MessageRecord, session: &SessionIdentity) -> Self {
        let mine = session.is_me(&record.sender_id);
        let reactions = record
            .reactions
            .into_iter()
            .filter(|r| !r.user_ids.is_empty())
            .map(|r| Reaction {
                emoji: r.emoji,
                reactors: r.user_ids.into_iter().collect(),
            })
            .collect();

        Self {
            id: MessageId::Server(record.id),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content,
            created_at: record.created_at,
            status: record.status.unwrap_or(DeliveryStatus::Sent),
            parent_id: record.parent_id,
            mentions: record.mentions,
            reactions,
            capabilities: Capabilities {
                deletable: record.can_delete.unwrap_or(mine),
                editable: record.can_edit.unwrap_or(mine),
            },
            edited: record.edited,
            client_ref: record.client_ref,
        }
    }

    pub fn has_reacted(&self, user_id: &str, emoji: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.emoji == emoji && r.reactors.contains(user_id))
    }

    /// Set one (user, emoji) membership; empty reactions are dropped
    pub fn set_reaction(&mut self, user_id: &str, emoji: &str, present: bool) {
        match self.reactions.iter_mut().find(|r| r.emoji == emoji) {
            Some(reaction) => {
                if present {
                    reaction.reactors.insert(user_id.to_string());
                } else {
                    reaction.reactors.remove(user_id);
                }
            }
            None if present => self.reactions.push(Reaction {
                emoji: emoji.to_string(),
                reactors: BTreeSet::from([user_id.to_string()]),
            }),
            None => {}
        }
        self.reactions.retain(|r| !r.reactors.is_empty());
    }

    /// Keep a user's unconfirmed edit and reaction flips on the copy that
    /// replaces a pending entry
    pub fn carry_local(&mut self, local: &Message, user_id: &str) {
        if local.edited {
            self.content = local.content.clone();
            self.edited = true;
        }
        let emojis: BTreeSet<String> = self
            .reactions
            .iter()
            .chain(local.reactions.iter())
            .map(|r| r.emoji.clone())
            .collect();
        for emoji in emojis {
            self.set_reaction(user_id, &emoji, local.has_reacted(user_id, &emoji));
        }
    }

    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions
            .iter()
            .find(|r| r.emoji == emoji)
            .map(Reaction::count)
            .unwrap_or(0)
    }

    pub fn summary(&self) -> LastMessage {
        LastMessage {
            sender_id: self.sender_id.clone(),
            content: self.content.clone(),
            at: self.created_at,
        }
    }
}

// ─── Notifications & paging ──────────────────────────────────────────────────

/// Per-conversation unread count pushed for the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDigest {
    pub conversation_id: ConversationId,
    pub unread: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub search: Option<String>,
    pub page_index: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub page_index: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub total_count: u64,
}

impl PageMeta {
    pub fn has_more(&self) -> bool {
        self.page_index + 1 < self.total_pages
    }
}

// ─── Wire records (external shapes) ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub name: Option<String>,
    pub is_group: bool,
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    pub role: Option<String>,
    pub online: Option<bool>,
}

impl UserRecord {
    pub fn label(&self) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if !full.is_empty() {
            full.to_string()
        } else if !self.email.trim().is_empty() {
            self.email.trim().to_string()
        } else {
            self.id.clone()
        }
    }

    pub fn into_participant(self) -> Participant {
        Participant {
            label: self.label(),
            role: Role::from_wire(self.role.as_deref()),
            presence: match self.online {
                Some(true) => Presence::Online,
                Some(false) => Presence::Offline,
                None => Presence::Unknown,
            },
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub emoji: String,
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub reactions: Vec<ReactionRecord>,
    #[serde(default)]
    pub edited: bool,
    pub can_delete: Option<bool>,
    pub can_edit: Option<bool>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub content: Vec<MessageRecord>,
    pub page_index: u32,
    pub total_pages: u32,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub mentions: Vec<UserId>,
    pub parent_id: Option<String>,
    /// Correlation key the server echoes on the stored message
    pub client_ref: String,
}

// ─── Engine events ───────────────────────────────────────────────────────────

/// Observer notifications fanned out by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The directory was replaced by a load (possibly partial)
    DirectoryReplaced { conversations: usize, participants: usize },
    /// A conversation's message list changed
    MessagesChanged { conversation_id: ConversationId },
    /// A live snapshot replaced the conversation's view
    LiveSnapshotApplied { conversation_id: ConversationId, messages: usize },
    /// A temp entry was replaced by its authoritative copy
    MessageReconciled { temp_id: String, server_id: String },
    /// A send failed; the entry stays as FAILED
    SendFailed { conversation_id: ConversationId, temp_id: String, error: String },
    /// An optimistic edit/delete/reaction was rolled back
    MutationRolledBack { conversation_id: ConversationId, message_id: String },
    /// Merged unread counts changed
    UnreadChanged { total: u32 },
    /// A live feed closed on its own
    SubscriptionDropped { conversation_id: ConversationId },
    /// A live feed reported an error but stays open
    SubscriptionError { key: String, error: String },
}
