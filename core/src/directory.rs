/// Conversation directory: conversations + participants for the signed-in user
///
/// `load()` fetches both lists concurrently and swaps the whole directory in one
/// step. A failed half keeps its previous state (or the cached copy on a cold
/// start) and is reported in the returned `LoadReport`.
use crate::backend::ChatApi;
use crate::cache::LocalCache;
use crate::error::{Result, SyncError};
use crate::model::{
    Conversation, ConversationId, ConversationKind, ConversationRecord, EngineEvent, LastMessage,
    Participant, Presence, Role, UserId,
};
use crate::session::SessionIdentity;
use crate::utils::EventEmitter;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub conversations_error: Option<SyncError>,
    pub participants_error: Option<SyncError>,
    /// Some portion was served from the local cache
    pub from_cache: bool,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.conversations_error.is_none() && self.participants_error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub conversations: Vec<Conversation>,
    pub participants: Vec<Participant>,
}

#[derive(Default)]
struct DirectoryState {
    conversations: IndexMap<ConversationId, Conversation>,
    participants: IndexMap<UserId, Participant>,
    /// Merged unread counts pushed by the digest aggregator
    unread: HashMap<ConversationId, u32>,
    loaded: bool,
    last_report: Option<LoadReport>,
}

pub struct ConversationDirectory {
    api: Arc<dyn ChatApi>,
    cache: LocalCache,
    session: SessionIdentity,
    events: EventEmitter,
    state: RwLock<DirectoryState>,
}

impl ConversationDirectory {
    pub fn new(
        api: Arc<dyn ChatApi>,
        cache: LocalCache,
        session: SessionIdentity,
        events: EventEmitter,
    ) -> Self {
        Self {
            api,
            cache,
            session,
            events,
            state: RwLock::new(DirectoryState::default()),
        }
    }

    fn cache_key(&self) -> String {
        format!("directory:{}", self.session.user_id)
    }

    /// Fetch conversations and users concurrently and replace the directory
    pub async fn load(&self) -> Result<LoadReport> {
        let (conversations, users) =
            tokio::join!(self.api.list_conversations(), self.api.list_users());

        let mut report = LoadReport::default();
        let cached = {
            let state = self.state.read().await;
            if state.loaded {
                None
            } else {
                self.read_cache()
            }
        };

        let mut state = self.state.write().await;

        let participants = match users {
            Ok(users) => users
                .into_iter()
                .map(|u| {
                    let p = u.into_participant();
                    (p.id.clone(), p)
                })
                .collect::<IndexMap<_, _>>(),
            Err(e) => {
                warn!("User directory fetch failed: {}", e);
                report.participants_error = Some(e);
                match &cached {
                    Some(c) => {
                        report.from_cache = true;
                        c.participants.iter().map(|p| (p.id.clone(), p.clone())).collect()
                    }
                    None => state.participants.clone(),
                }
            }
        };

        let conversations = match conversations {
            Ok(records) => records
                .into_iter()
                .map(|r| {
                    let c = resolve_conversation(r, &self.session, &participants, &state.unread);
                    (c.id.clone(), c)
                })
                .collect::<IndexMap<_, _>>(),
            Err(e) => {
                warn!("Conversation list fetch failed: {}", e);
                report.conversations_error = Some(e);
                match &cached {
                    Some(c) => {
                        report.from_cache = true;
                        c.conversations
                            .iter()
                            .map(|conv| {
                                let mut conv = conv.clone();
                                conv.unread_count = state.unread.get(&conv.id).copied().unwrap_or(0);
                                (conv.id.clone(), conv)
                            })
                            .collect()
                    }
                    None => state.conversations.clone(),
                }
            }
        };

        // Single swap, never a partial merge
        state.participants = participants;
        state.conversations = conversations;
        state.loaded = true;
        state.last_report = Some(report.clone());

        let snapshot = DirectorySnapshot {
            conversations: state.conversations.values().cloned().collect(),
            participants: state.participants.values().cloned().collect(),
        };
        drop(state);

        if report.conversations_error.is_none() || report.participants_error.is_none() {
            if let Err(e) = self.cache.put(&self.cache_key(), &snapshot) {
                warn!("Failed to cache directory: {}", e);
            }
        }

        info!(
            "Directory loaded: {} conversations, {} participants (complete: {})",
            snapshot.conversations.len(),
            snapshot.participants.len(),
            report.is_complete()
        );
        self.events.emit(EngineEvent::DirectoryReplaced {
            conversations: snapshot.conversations.len(),
            participants: snapshot.participants.len(),
        });

        match (&report.conversations_error, &report.participants_error) {
            (Some(e), Some(_)) => Err(e.clone()),
            _ => Ok(report),
        }
    }

    fn read_cache(&self) -> Option<DirectorySnapshot> {
        match self.cache.get::<DirectorySnapshot>(&self.cache_key()) {
            Ok(found) => found,
            Err(e) => {
                warn!("Directory cache unreadable: {}", e);
                None
            }
        }
    }

    pub async fn snapshot(&self) -> DirectorySnapshot {
        let state = self.state.read().await;
        DirectorySnapshot {
            conversations: state.conversations.values().cloned().collect(),
            participants: state.participants.values().cloned().collect(),
        }
    }

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state.read().await.conversations.get(id).cloned()
    }

    pub async fn participant(&self, id: &str) -> Option<Participant> {
        self.state.read().await.participants.get(id).cloned()
    }

    /// Error flags of the most recent load
    pub async fn last_report(&self) -> Option<LoadReport> {
        self.state.read().await.last_report.clone()
    }

    /// Replace every merged unread count; conversations absent from `counts` read 0
    pub async fn apply_unread(&self, counts: &HashMap<ConversationId, u32>) {
        let mut state = self.state.write().await;
        state.unread = counts.clone();
        for conv in state.conversations.values_mut() {
            conv.unread_count = counts.get(&conv.id).copied().unwrap_or(0);
        }
    }

    pub async fn unread(&self, conversation_id: &str) -> u32 {
        self.state
            .read()
            .await
            .conversations
            .get(conversation_id)
            .map(|c| c.unread_count)
            .unwrap_or(0)
    }

    /// Keep the newest summary only
    pub async fn update_last_message(&self, conversation_id: &str, summary: LastMessage) {
        let mut state = self.state.write().await;
        if let Some(conv) = state.conversations.get_mut(conversation_id) {
            let newer = conv
                .last_message
                .as_ref()
                .map(|current| summary.at >= current.at)
                .unwrap_or(true);
            if newer {
                conv.last_message = Some(summary);
            }
        }
    }

    pub async fn remove_conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let mut state = self.state.write().await;
        state.unread.remove(conversation_id);
        state.conversations.shift_remove(conversation_id)
    }

    pub async fn add_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.require_conversation(conversation_id).await?;
        self.api.add_participant(conversation_id, user_id).await?;

        let mut state = self.state.write().await;
        if let Some(conv) = state.conversations.get_mut(conversation_id) {
            if !conv.participants.iter().any(|p| p == user_id) {
                conv.participants.push(user_id.to_string());
            }
        }
        debug!("Added {} to {}", user_id, conversation_id);
        Ok(())
    }

    pub async fn remove_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.require_conversation(conversation_id).await?;
        self.api.remove_participant(conversation_id, user_id).await?;

        let mut state = self.state.write().await;
        if let Some(conv) = state.conversations.get_mut(conversation_id) {
            conv.participants.retain(|p| p != user_id);
        }
        debug!("Removed {} from {}", user_id, conversation_id);
        Ok(())
    }

    pub async fn change_role(&self, user_id: &str, role: Role) -> Result<()> {
        if self.participant(user_id).await.is_none() {
            return Err(SyncError::NotFound(format!("participant {}", user_id)));
        }
        self.api.change_role(user_id, role).await?;

        if let Some(p) = self.state.write().await.participants.get_mut(user_id) {
            p.role = role;
        }
        Ok(())
    }

    async fn require_conversation(&self, conversation_id: &str) -> Result<()> {
        if self.state.read().await.conversations.contains_key(conversation_id) {
            Ok(())
        } else {
            Err(SyncError::NotFound(format!("conversation {}", conversation_id)))
        }
    }

    /// Forget everything (session end)
    pub async fn clear(&self) {
        *self.state.write().await = DirectoryState::default();
    }
}

fn resolve_conversation(
    record: ConversationRecord,
    session: &SessionIdentity,
    participants: &IndexMap<UserId, Participant>,
    unread: &HashMap<ConversationId, u32>,
) -> Conversation {
    let kind = if record.is_group || record.participant_ids.len() > 2 {
        ConversationKind::Group
    } else {
        ConversationKind::Direct
    };

    let label_of = |id: &str| {
        participants
            .get(id)
            .map(|p| p.label.clone())
            .unwrap_or_else(|| id.to_string())
    };
    let explicit = record.name.clone().filter(|n| !n.trim().is_empty());

    let name = match kind {
        // The other participant, not the raw conversation name
        ConversationKind::Direct => match record.participant_ids.iter().find(|p| !session.is_me(p)) {
            Some(other) => label_of(other.as_str()),
            None => explicit.unwrap_or_else(|| session.display_name.clone()),
        },
        ConversationKind::Group => explicit.unwrap_or_else(|| {
            record
                .participant_ids
                .iter()
                .filter(|p| !session.is_me(p))
                .map(|p| label_of(p.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        }),
    };

    Conversation {
        unread_count: unread.get(&record.id).copied().unwrap_or(0),
        id: record.id,
        name,
        kind,
        participants: record.participant_ids,
        last_message: record.last_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participants() -> IndexMap<UserId, Participant> {
        [("u1", "Ada Lovelace"), ("u2", "Alan Turing"), ("u3", "Grace Hopper")]
            .into_iter()
            .map(|(id, label)| {
                (
                    id.to_string(),
                    Participant {
                        id: id.to_string(),
                        label: label.to_string(),
                        role: Role::Member,
                        presence: Presence::Unknown,
                    },
                )
            })
            .collect()
    }

    fn record(id: &str, name: Option<&str>, is_group: bool, members: &[&str]) -> ConversationRecord {
        ConversationRecord {
            id: id.to_string(),
            name: name.map(str::to_string),
            is_group,
            participant_ids: members.iter().map(|m| m.to_string()).collect(),
            last_message: None,
        }
    }

    #[test]
    fn test_direct_name_is_other_participant() {
        let me = SessionIdentity::new("u1", "Ada Lovelace").unwrap();
        let conv = resolve_conversation(
            record("d1", Some("u1_u2"), false, &["u1", "u2"]),
            &me,
            &participants(),
            &HashMap::new(),
        );
        assert_eq!(conv.kind, ConversationKind::Direct);
        assert_eq!(conv.name, "Alan Turing");
    }

    #[test]
    fn test_group_name_falls_back_to_member_labels() {
        let me = SessionIdentity::new("u1", "Ada Lovelace").unwrap();
        let unread = HashMap::from([("g1".to_string(), 4)]);
        let conv = resolve_conversation(
            record("g1", None, true, &["u1", "u2", "u3"]),
            &me,
            &participants(),
            &unread,
        );
        assert_eq!(conv.kind, ConversationKind::Group);
        assert_eq!(conv.name, "Alan Turing, Grace Hopper");
        assert_eq!(conv.unread_count, 4);
    }
}
