/// Per-conversation message cache with pagination
///
/// Each conversation keeps an insertion-ordered, id-keyed map. Every write is
/// stamped with a monotonic ticket; a page response whose ticket predates a
/// newer write to the same list cannot roll that write back.
use crate::backend::ChatApi;
use crate::error::Result;
use crate::model::{
    ConversationId, DeliveryStatus, EngineEvent, Message, MessageId, PageMeta, PageQuery,
};
use crate::session::SessionIdentity;
use crate::utils::EventEmitter;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    /// False when a newer write superseded this response
    pub applied: bool,
    pub added: usize,
    pub meta: PageMeta,
}

/// Result of swapping a pending entry for its confirmed copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Temp entry replaced in place
    Replaced,
    /// The confirmed id was already listed; the temp entry was dropped
    AlreadyPresent,
    /// The temp entry no longer exists (deleted or evicted)
    Missing,
}

#[derive(Debug, Clone)]
struct Slot {
    message: Message,
    stamp: u64,
}

#[derive(Debug, Default)]
struct ConversationMessages {
    entries: IndexMap<MessageId, Slot>,
    meta: Option<PageMeta>,
    search: Option<String>,
    issued: u64,
    /// Ticket of the last first-page replacement
    reset_at: u64,
    /// Ticket of the last live snapshot
    live_at: u64,
}

impl ConversationMessages {
    fn ticket(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    fn messages(&self) -> Vec<Message> {
        self.entries.values().map(|s| s.message.clone()).collect()
    }
}

pub struct MessageStore {
    api: Arc<dyn ChatApi>,
    session: SessionIdentity,
    events: EventEmitter,
    page_size: u32,
    conversations: RwLock<HashMap<ConversationId, ConversationMessages>>,
}

impl MessageStore {
    pub fn new(
        api: Arc<dyn ChatApi>,
        session: SessionIdentity,
        events: EventEmitter,
        page_size: u32,
    ) -> Self {
        Self {
            api,
            session,
            events,
            page_size,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch one page: index 0 replaces the list, later pages append
    pub async fn load_page(&self, conversation_id: &str, query: PageQuery) -> Result<PageOutcome> {
        let query = PageQuery {
            page_size: if query.page_size == 0 {
                self.page_size
            } else {
                query.page_size
            },
            ..query
        };

        let ticket = {
            let mut convs = self.conversations.write().await;
            convs
                .entry(conversation_id.to_string())
                .or_default()
                .ticket()
        };
        debug!(
            "Loading page {} of {} (ticket {}, search {:?})",
            query.page_index, conversation_id, ticket, query.search
        );

        let page = self.api.fetch_messages(conversation_id, &query).await?;
        let meta = PageMeta {
            page_index: page.page_index,
            page_size: query.page_size,
            total_pages: page.total_pages,
            total_count: page.total_count,
        };
        let incoming: Vec<Message> = page
            .content
            .into_iter()
            .map(|r| Message::from_record(r, &self.session))
            .collect();

        let (applied, added, unseen) = {
            let mut convs = self.conversations.write().await;
            let Some(state) = convs.get_mut(conversation_id) else {
                debug!("Conversation {} evicted while loading", conversation_id);
                return Ok(PageOutcome {
                    applied: false,
                    added: 0,
                    meta,
                });
            };

            if query.page_index == 0 {
                if ticket < state.live_at {
                    (false, 0, Vec::new())
                } else {
                    let unseen = self.unseen_ids(&incoming);
                    let added = replace_first_page(state, incoming, ticket);
                    state.reset_at = ticket;
                    state.search = query.search.clone();
                    state.meta = Some(meta);
                    (true, added, unseen)
                }
            } else if ticket < state.reset_at {
                (false, 0, Vec::new())
            } else {
                let mut added = 0;
                let mut appended = Vec::new();
                for message in incoming {
                    if !state.entries.contains_key(&message.id) {
                        appended.push(message.clone());
                        state.entries.insert(
                            message.id.clone(),
                            Slot {
                                message,
                                stamp: ticket,
                            },
                        );
                        added += 1;
                    }
                }
                let newest_meta = state
                    .meta
                    .map(|m| m.page_index <= meta.page_index)
                    .unwrap_or(true);
                if newest_meta {
                    state.meta = Some(meta);
                }
                (true, added, self.unseen_ids(&appended))
            }
        };

        if !applied {
            info!(
                "Discarded stale page {} of {} (ticket {})",
                query.page_index, conversation_id, ticket
            );
            return Ok(PageOutcome {
                applied,
                added,
                meta,
            });
        }

        self.events.emit(EngineEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });

        if !unseen.is_empty() {
            self.mark_read(conversation_id, unseen).await;
        }

        Ok(PageOutcome {
            applied,
            added,
            meta,
        })
    }

    /// Load the page after the last one applied, if there is one
    pub async fn load_more(&self, conversation_id: &str) -> Result<Option<PageOutcome>> {
        let next = {
            let convs = self.conversations.read().await;
            convs.get(conversation_id).and_then(|state| {
                state.meta.filter(PageMeta::has_more).map(|meta| PageQuery {
                    search: state.search.clone(),
                    page_index: meta.page_index + 1,
                    page_size: meta.page_size,
                })
            })
        };
        match next {
            Some(query) => self.load_page(conversation_id, query).await.map(Some),
            None => Ok(None),
        }
    }

    /// Other people's messages not yet read by the current user
    fn unseen_ids(&self, messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter(|m| !m.id.is_temp() && !self.session.is_me(&m.sender_id))
            .filter(|m| matches!(m.status, DeliveryStatus::Sent | DeliveryStatus::Delivered))
            .map(|m| m.id.as_str().to_string())
            .collect()
    }

    /// One batched receipt call for the whole page
    async fn mark_read(&self, conversation_id: &str, ids: Vec<String>) {
        match self
            .api
            .update_receipts(conversation_id, &ids, DeliveryStatus::Read)
            .await
        {
            Ok(()) => {
                let mut convs = self.conversations.write().await;
                if let Some(state) = convs.get_mut(conversation_id) {
                    for id in &ids {
                        if let Some(slot) = state.entries.get_mut(&MessageId::server(id.as_str())) {
                            slot.message.status = DeliveryStatus::Read;
                        }
                    }
                }
                debug!("Marked {} messages read in {}", ids.len(), conversation_id);
            }
            Err(e) => warn!("Receipt update for {} failed: {}", conversation_id, e),
        }
    }

    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(ConversationMessages::messages)
            .unwrap_or_default()
    }

    pub async fn get(&self, conversation_id: &str, id: &MessageId) -> Option<Message> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .and_then(|state| state.entries.get(id))
            .map(|slot| slot.message.clone())
    }

    pub async fn position(&self, conversation_id: &str, id: &MessageId) -> Option<usize> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .and_then(|state| state.entries.get_index_of(id))
    }

    pub async fn meta(&self, conversation_id: &str) -> Option<PageMeta> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .and_then(|state| state.meta)
    }

    pub async fn has_more(&self, conversation_id: &str) -> bool {
        self.meta(conversation_id)
            .await
            .map(|m| m.has_more())
            .unwrap_or(false)
    }

    /// Append an optimistic entry at the tail
    pub(crate) async fn insert_pending(&self, message: Message) {
        let mut convs = self.conversations.write().await;
        let state = convs.entry(message.conversation_id.clone()).or_default();
        let stamp = state.ticket();
        state.entries.insert(message.id.clone(), Slot { message, stamp });
    }

    /// Swap a temp entry for its confirmed copy, keeping its list position
    pub(crate) async fn confirm_pending(
        &self,
        conversation_id: &str,
        temp_id: &MessageId,
        mut confirmed: Message,
    ) -> ConfirmOutcome {
        let me = &self.session.user_id;
        let mut convs = self.conversations.write().await;
        let Some(state) = convs.get_mut(conversation_id) else {
            return ConfirmOutcome::Missing;
        };
        let Some(index) = state.entries.get_index_of(temp_id) else {
            return ConfirmOutcome::Missing;
        };
        let stamp = state.ticket();
        let Some((_, pending)) = state.entries.shift_remove_index(index) else {
            return ConfirmOutcome::Missing;
        };
        if let Some(existing) = state.entries.get_mut(&confirmed.id) {
            existing.message.carry_local(&pending.message, me);
            existing.stamp = stamp;
            return ConfirmOutcome::AlreadyPresent;
        }

        confirmed.carry_local(&pending.message, me);
        state
            .entries
            .shift_insert(index, confirmed.id.clone(), Slot { message: confirmed, stamp });
        ConfirmOutcome::Replaced
    }

    /// Apply `f` to one entry and return the updated copy
    pub(crate) async fn update<F>(&self, conversation_id: &str, id: &MessageId, f: F) -> Option<Message>
    where
        F: FnOnce(&mut Message),
    {
        let mut convs = self.conversations.write().await;
        let state = convs.get_mut(conversation_id)?;
        let stamp = state.ticket();
        let slot = state.entries.get_mut(id)?;
        f(&mut slot.message);
        slot.stamp = stamp;
        Some(slot.message.clone())
    }

    pub(crate) async fn remove(&self, conversation_id: &str, id: &MessageId) -> Option<(usize, Message)> {
        let mut convs = self.conversations.write().await;
        let state = convs.get_mut(conversation_id)?;
        state
            .entries
            .shift_remove_full(id)
            .map(|(index, _, slot)| (index, slot.message))
    }

    /// Put a removed entry back at (or near) its old position
    pub(crate) async fn reinsert(&self, conversation_id: &str, index: usize, message: Message) -> bool {
        let mut convs = self.conversations.write().await;
        let state = convs.entry(conversation_id.to_string()).or_default();
        if state.entries.contains_key(&message.id) {
            return false;
        }
        let stamp = state.ticket();
        let index = index.min(state.entries.len());
        state
            .entries
            .shift_insert(index, message.id.clone(), Slot { message, stamp });
        true
    }

    /// Replace the list with a complete live snapshot
    ///
    /// Temp entries survive at the tail unless listed in `resolved`; server ids
    /// listed in `tombstones` are skipped.
    pub(crate) async fn apply_live(
        &self,
        conversation_id: &str,
        batch: Vec<Message>,
        resolved: &HashSet<MessageId>,
        tombstones: &HashSet<MessageId>,
    ) -> usize {
        let mut convs = self.conversations.write().await;
        let state = convs.entry(conversation_id.to_string()).or_default();
        let stamp = state.ticket();

        let previous = std::mem::take(&mut state.entries);
        let confirming: HashMap<&str, &Message> = previous
            .iter()
            .filter(|(id, _)| resolved.contains(*id))
            .map(|(id, slot)| (id.as_str(), &slot.message))
            .collect();
        for mut message in batch {
            if tombstones.contains(&message.id) {
                continue;
            }
            if let Some(local) = message.client_ref.as_deref().and_then(|r| confirming.get(r)) {
                message.carry_local(local, &self.session.user_id);
            }
            state
                .entries
                .insert(message.id.clone(), Slot { message, stamp });
        }
        let live = state.entries.len();
        for (id, slot) in previous {
            if id.is_temp() && !resolved.contains(&id) {
                state.entries.insert(id, slot);
            }
        }
        state.live_at = stamp;
        live
    }

    /// Drop a conversation's cached messages (conversation deleted)
    pub async fn evict(&self, conversation_id: &str) -> bool {
        self.conversations
            .write()
            .await
            .remove(conversation_id)
            .is_some()
    }

    /// Drop everything (session end)
    pub async fn clear(&self) {
        self.conversations.write().await.clear();
    }
}

/// First page replaces the list; entries written after the request was issued
/// and temp entries are carried over behind the page
fn replace_first_page(state: &mut ConversationMessages, incoming: Vec<Message>, ticket: u64) -> usize {
    let previous = std::mem::take(&mut state.entries);
    for message in incoming {
        state.entries.insert(
            message.id.clone(),
            Slot {
                message,
                stamp: ticket,
            },
        );
    }
    let added = state.entries.len();
    for (id, slot) in previous {
        // A write newer than the request wins over the page copy
        if id.is_temp() || slot.stamp > ticket {
            state.entries.insert(id, slot);
        }
    }
    added
}
