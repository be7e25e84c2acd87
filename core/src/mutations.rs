/// Optimistic mutations and temp id reconciliation
///
/// Sends insert a SENDING placeholder keyed by a temp id and reconcile it with
/// whichever authoritative copy arrives first: the request response or a live
/// snapshot carrying the same `client_ref`. Edits, deletes and reaction toggles
/// apply locally first and roll back when the server rejects them.
use crate::backend::ChatApi;
use crate::coalesce::KeyedLocks;
use crate::directory::ConversationDirectory;
use crate::error::{Result, SyncError};
use crate::message_store::{ConfirmOutcome, MessageStore};
use crate::model::{
    ConversationId, DeliveryStatus, EngineEvent, Message, MessageId, SendRequest, UserId,
};
use crate::session::SessionIdentity;
use crate::utils::EventEmitter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Lifecycle of one optimistic send as seen by waiters
#[derive(Debug, Clone, PartialEq, Eq)]
enum SendState {
    InFlight,
    Confirmed(MessageId),
    Failed(SyncError),
}

/// Where a mutation on a possibly-temp message must go
enum Target {
    Remote(String),
    /// The send failed; the message only exists locally
    NeverSent,
}

struct ReactionSync {
    confirmed: bool,
    queued: usize,
}

struct PendingSend {
    conversation_id: ConversationId,
    state: watch::Sender<SendState>,
}

pub struct MutationEngine {
    api: Arc<dyn ChatApi>,
    session: SessionIdentity,
    store: Arc<MessageStore>,
    directory: Arc<ConversationDirectory>,
    events: EventEmitter,
    retention: Duration,
    pending: Mutex<HashMap<String, PendingSend>>,
    /// temp id -> (server id, when it was reconciled)
    reconciled: Mutex<HashMap<String, (MessageId, Instant)>>,
    /// Server ids deleted locally whose delete has not settled yet
    tombstones: Mutex<HashSet<MessageId>>,
    reaction_locks: KeyedLocks,
    /// Per (message, user, emoji): last state the server accepted and queued calls
    reactions: Mutex<HashMap<String, ReactionSync>>,
}

impl MutationEngine {
    pub fn new(
        api: Arc<dyn ChatApi>,
        session: SessionIdentity,
        store: Arc<MessageStore>,
        directory: Arc<ConversationDirectory>,
        events: EventEmitter,
        retention: Duration,
    ) -> Self {
        Self {
            api,
            session,
            store,
            directory,
            events,
            retention,
            pending: Mutex::new(HashMap::new()),
            reconciled: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            reaction_locks: KeyedLocks::new(),
            reactions: Mutex::new(HashMap::new()),
        }
    }

    // ─── Send ────────────────────────────────────────────────────────────────

    /// Insert a SENDING entry at the tail and send it
    ///
    /// Returns the server id once confirmed. On failure the entry stays in the
    /// list as FAILED until `retry` or `discard`.
    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        mentions: Vec<UserId>,
        parent_id: Option<String>,
    ) -> Result<MessageId> {
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message content is empty".to_string()));
        }

        let message = Message::pending(
            &self.session,
            conversation_id,
            content.to_string(),
            mentions,
            parent_id,
        );
        let (state, _) = watch::channel(SendState::InFlight);
        self.pending.lock().await.insert(
            message.id.as_str().to_string(),
            PendingSend {
                conversation_id: conversation_id.to_string(),
                state,
            },
        );
        self.store.insert_pending(message.clone()).await;
        debug!("Queued {} in {}", message.id, conversation_id);
        self.changed(conversation_id);

        self.dispatch(message).await
    }

    /// Resend a FAILED entry under the same temp id
    pub async fn retry(&self, conversation_id: &str, temp_id: &MessageId) -> Result<MessageId> {
        let message = self
            .store
            .get(conversation_id, temp_id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("message {}", temp_id)))?;
        if message.status != DeliveryStatus::Failed {
            return Err(SyncError::Validation(format!(
                "message {} has not failed",
                temp_id
            )));
        }

        {
            let mut pending = self.pending.lock().await;
            match pending.get(temp_id.as_str()) {
                Some(p) => {
                    p.state.send_replace(SendState::InFlight);
                }
                None => {
                    let (state, _) = watch::channel(SendState::InFlight);
                    pending.insert(
                        temp_id.as_str().to_string(),
                        PendingSend {
                            conversation_id: conversation_id.to_string(),
                            state,
                        },
                    );
                }
            }
        }
        let message = self
            .store
            .update(conversation_id, temp_id, |m| m.status = DeliveryStatus::Sending)
            .await
            .unwrap_or(message);
        info!("Retrying {} in {}", temp_id, conversation_id);
        self.changed(conversation_id);

        self.dispatch(message).await
    }

    /// Drop a FAILED entry for good
    pub async fn discard(&self, conversation_id: &str, temp_id: &MessageId) -> Result<()> {
        let message = self
            .store
            .get(conversation_id, temp_id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("message {}", temp_id)))?;
        if message.status != DeliveryStatus::Failed {
            return Err(SyncError::Validation(format!(
                "message {} has not failed",
                temp_id
            )));
        }
        self.store.remove(conversation_id, temp_id).await;
        self.pending.lock().await.remove(temp_id.as_str());
        self.changed(conversation_id);
        Ok(())
    }

    async fn dispatch(&self, message: Message) -> Result<MessageId> {
        let temp_id = message.id.clone();
        let conversation_id = message.conversation_id.clone();
        let request = SendRequest {
            conversation_id: conversation_id.clone(),
            sender_id: message.sender_id,
            content: message.content,
            mentions: message.mentions,
            parent_id: message.parent_id,
            client_ref: temp_id.as_str().to_string(),
        };

        match self.api.send_message(request).await {
            Ok(record) => {
                if let Some(server_id) = self.reconciled_id(temp_id.as_str()).await {
                    debug!("Send response for {} already reconciled as {}", temp_id, server_id);
                    return Ok(server_id);
                }

                let mut confirmed = Message::from_record(record, &self.session);
                if confirmed.status == DeliveryStatus::Sending {
                    confirmed.status = DeliveryStatus::Sent;
                }
                confirmed.client_ref = Some(temp_id.as_str().to_string());
                let server_id = confirmed.id.clone();
                let summary = confirmed.summary();

                let outcome = self
                    .store
                    .confirm_pending(&conversation_id, &temp_id, confirmed)
                    .await;
                if outcome == ConfirmOutcome::Missing {
                    debug!("{} left the list before its send confirmed", temp_id);
                }
                self.resolve(&temp_id, server_id.clone()).await;
                self.directory
                    .update_last_message(&conversation_id, summary)
                    .await;

                info!("Sent {} as {}", temp_id, server_id);
                self.changed(&conversation_id);
                Ok(server_id)
            }
            Err(e) => {
                if let Some(server_id) = self.reconciled_id(temp_id.as_str()).await {
                    warn!(
                        "Send of {} reported {} but the live feed already confirmed it",
                        temp_id, e
                    );
                    return Ok(server_id);
                }

                warn!("Send of {} failed: {}", temp_id, e);
                self.store
                    .update(&conversation_id, &temp_id, |m| {
                        m.status = DeliveryStatus::Failed
                    })
                    .await;
                if let Some(p) = self.pending.lock().await.get(temp_id.as_str()) {
                    p.state.send_replace(SendState::Failed(e.clone()));
                }
                self.events.emit(EngineEvent::SendFailed {
                    conversation_id: conversation_id.clone(),
                    temp_id: temp_id.as_str().to_string(),
                    error: e.to_string(),
                });
                self.changed(&conversation_id);
                Err(e)
            }
        }
    }

    /// Record temp -> server and wake anything waiting on the send
    async fn resolve(&self, temp_id: &MessageId, server_id: MessageId) {
        {
            let mut reconciled = self.reconciled.lock().await;
            let retention = self.retention;
            reconciled.retain(|_, (_, at)| at.elapsed() < retention);
            reconciled.insert(
                temp_id.as_str().to_string(),
                (server_id.clone(), Instant::now()),
            );
        }
        if let Some(p) = self.pending.lock().await.remove(temp_id.as_str()) {
            p.state.send_replace(SendState::Confirmed(server_id.clone()));
        }
        self.events.emit(EngineEvent::MessageReconciled {
            temp_id: temp_id.as_str().to_string(),
            server_id: server_id.as_str().to_string(),
        });
    }

    async fn reconciled_id(&self, temp_id: &str) -> Option<MessageId> {
        self.reconciled
            .lock()
            .await
            .get(temp_id)
            .map(|(id, _)| id.clone())
    }

    /// The id the store currently lists a message under
    pub async fn current_id(&self, id: &MessageId) -> MessageId {
        match id {
            MessageId::Temp(temp) => self.reconciled_id(temp).await.unwrap_or_else(|| id.clone()),
            MessageId::Server(_) => id.clone(),
        }
    }

    /// Wait for a temp message's send to settle
    async fn resolve_target(&self, id: &MessageId) -> Result<Target> {
        let temp = match id {
            MessageId::Server(server) => return Ok(Target::Remote(server.clone())),
            MessageId::Temp(temp) => temp,
        };
        if let Some(server) = self.reconciled_id(temp).await {
            return Ok(Target::Remote(server.as_str().to_string()));
        }

        let rx = self
            .pending
            .lock()
            .await
            .get(temp.as_str())
            .map(|p| p.state.subscribe());
        let Some(mut rx) = rx else {
            return Err(SyncError::Unconfirmed(temp.clone()));
        };

        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                SendState::Confirmed(server) => return Ok(Target::Remote(server.as_str().to_string())),
                SendState::Failed(_) => return Ok(Target::NeverSent),
                SendState::InFlight => {}
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a final state: discarded or reconciled
                return match self.reconciled_id(temp).await {
                    Some(server) => Ok(Target::Remote(server.as_str().to_string())),
                    None => Err(SyncError::Unconfirmed(temp.clone())),
                };
            }
        }
    }

    // ─── Live feed ───────────────────────────────────────────────────────────

    /// Apply a live snapshot, resolving any pending sends it already contains
    pub async fn absorb_live(&self, conversation_id: &str, batch: Vec<Message>) {
        let matched: Vec<(MessageId, MessageId)> = {
            let pending = self.pending.lock().await;
            batch
                .iter()
                .filter_map(|m| {
                    let client_ref = m.client_ref.as_deref()?;
                    pending
                        .get(client_ref)
                        .filter(|p| p.conversation_id == conversation_id)
                        .map(|_| (MessageId::Temp(client_ref.to_string()), m.id.clone()))
                })
                .collect()
        };

        let mut resolved = HashSet::new();
        for (temp_id, server_id) in matched {
            debug!("Live feed confirmed {} as {}", temp_id, server_id);
            self.resolve(&temp_id, server_id).await;
            resolved.insert(temp_id);
        }

        let summary = batch.last().map(Message::summary);
        let tombstones = self.tombstones.lock().await.clone();
        let live = self
            .store
            .apply_live(conversation_id, batch, &resolved, &tombstones)
            .await;
        if let Some(summary) = summary {
            self.directory
                .update_last_message(conversation_id, summary)
                .await;
        }

        self.events.emit(EngineEvent::LiveSnapshotApplied {
            conversation_id: conversation_id.to_string(),
            messages: live,
        });
        self.changed(conversation_id);
    }

    // ─── Reactions ───────────────────────────────────────────────────────────

    /// Flip the current user's reaction; returns whether it is now present
    ///
    /// Network calls for one (message, user, emoji) run one at a time and each
    /// pushes the latest local state, so the server ends where the last toggle
    /// left the view whatever order the calls were queued in.
    pub async fn toggle_reaction(
        &self,
        conversation_id: &str,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<bool> {
        let me = self.session.user_id.clone();
        let id = self.current_id(message_id).await;
        let key = format!("{}:{}:{}", id, me, emoji);

        let present = {
            let mut reactions = self.reactions.lock().await;
            let updated = self
                .store
                .update(conversation_id, &id, |m| {
                    let present = !m.has_reacted(&me, emoji);
                    m.set_reaction(&me, emoji, present);
                })
                .await
                .ok_or_else(|| SyncError::NotFound(format!("message {}", id)))?;
            let present = updated.has_reacted(&me, emoji);
            // With nothing queued the view matched the server before this flip
            let sync = reactions.entry(key.clone()).or_insert(ReactionSync {
                confirmed: !present,
                queued: 0,
            });
            sync.queued += 1;
            present
        };
        self.changed(conversation_id);

        let result = {
            let _turn = self.reaction_locks.acquire(&key).await;
            self.push_reaction(conversation_id, &id, &key, emoji).await
        };

        let (last, confirmed) = {
            let mut reactions = self.reactions.lock().await;
            match reactions.get_mut(&key) {
                Some(sync) => {
                    sync.queued = sync.queued.saturating_sub(1);
                    let done = sync.queued == 0;
                    let confirmed = sync.confirmed;
                    if done {
                        reactions.remove(&key);
                    }
                    (done, confirmed)
                }
                None => (true, !present),
            }
        };

        match result {
            Ok(()) => Ok(present),
            Err(e) => {
                warn!("Reaction {} on {} failed: {}", emoji, id, e);
                // Queued toggles still get their own attempt
                if last {
                    let current = self.current_id(&id).await;
                    self.store
                        .update(conversation_id, &current, |m| {
                            m.set_reaction(&me, emoji, confirmed)
                        })
                        .await;
                    self.rolled_back(conversation_id, &current);
                }
                Err(e)
            }
        }
    }

    /// Bring the server in line with the local membership for one triple
    async fn push_reaction(
        &self,
        conversation_id: &str,
        id: &MessageId,
        key: &str,
        emoji: &str,
    ) -> Result<()> {
        let me = &self.session.user_id;
        let current = self.current_id(id).await;
        let Some(desired) = self
            .store
            .get(conversation_id, &current)
            .await
            .map(|m| m.has_reacted(me, emoji))
        else {
            debug!("{} left the list before its reaction synced", current);
            return Ok(());
        };
        let confirmed = self
            .reactions
            .lock()
            .await
            .get(key)
            .map(|s| s.confirmed)
            .unwrap_or(!desired);
        if desired == confirmed {
            return Ok(());
        }

        let server = match self.resolve_target(&current).await? {
            Target::Remote(server) => server,
            Target::NeverSent => return Err(SyncError::Unconfirmed(current.as_str().to_string())),
        };
        if desired {
            self.api.add_reaction(&server, me, emoji).await?;
        } else {
            self.api.remove_reaction(&server, me, emoji).await?;
        }
        if let Some(sync) = self.reactions.lock().await.get_mut(key) {
            sync.confirmed = desired;
        }
        Ok(())
    }

    // ─── Edit / delete ───────────────────────────────────────────────────────

    pub async fn edit(
        &self,
        conversation_id: &str,
        message_id: &MessageId,
        content: &str,
    ) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message content is empty".to_string()));
        }
        let id = self.current_id(message_id).await;
        let before = self
            .store
            .get(conversation_id, &id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("message {}", id)))?;
        if !before.capabilities.editable {
            return Err(SyncError::Validation(format!("message {} is not editable", id)));
        }

        self.store
            .update(conversation_id, &id, |m| {
                m.content = content.to_string();
                m.edited = true;
            })
            .await;
        self.changed(conversation_id);

        let result = match self.resolve_target(&id).await {
            Ok(Target::Remote(server)) => {
                self.api
                    .edit_message(conversation_id, &server, content)
                    .await
            }
            Ok(Target::NeverSent) => Err(SyncError::Unconfirmed(id.as_str().to_string())),
            Err(e) => Err(e),
        };

        let current = self.current_id(&id).await;
        match result {
            Ok(record) => {
                let confirmed = Message::from_record(record, &self.session);
                let (content, edited) = (confirmed.content.clone(), confirmed.edited);
                let updated = self
                    .store
                    .update(conversation_id, &current, move |m| {
                        m.content = content;
                        m.edited = edited;
                    })
                    .await
                    .unwrap_or(confirmed);
                self.changed(conversation_id);
                Ok(updated)
            }
            Err(e) => {
                warn!("Edit of {} failed: {}", id, e);
                self.store
                    .update(conversation_id, &current, move |m| {
                        m.content = before.content;
                        m.edited = before.edited;
                    })
                    .await;
                self.rolled_back(conversation_id, &current);
                Err(e)
            }
        }
    }

    pub async fn delete(&self, conversation_id: &str, message_id: &MessageId) -> Result<()> {
        let id = self.current_id(message_id).await;
        let message = self
            .store
            .get(conversation_id, &id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("message {}", id)))?;
        if !message.capabilities.deletable {
            return Err(SyncError::Validation(format!("message {} is not deletable", id)));
        }

        let Some((index, mut removed)) = self.store.remove(conversation_id, &id).await else {
            return Err(SyncError::NotFound(format!("message {}", id)));
        };
        if !id.is_temp() {
            self.tombstones.lock().await.insert(id.clone());
        }
        self.changed(conversation_id);

        let server = match self.resolve_target(&id).await {
            Ok(Target::Remote(server)) => server,
            Ok(Target::NeverSent) => {
                self.pending.lock().await.remove(id.as_str());
                debug!("Dropped unsent {} from {}", id, conversation_id);
                return Ok(());
            }
            Err(e) => {
                self.store.reinsert(conversation_id, index, removed).await;
                self.rolled_back(conversation_id, &id);
                return Err(e);
            }
        };

        let server_id = MessageId::server(server.as_str());
        if id.is_temp() {
            // Confirmed while we waited; make sure the server copy stays hidden
            self.tombstones.lock().await.insert(server_id.clone());
            self.store.remove(conversation_id, &server_id).await;
        }

        let result = self.api.delete_message(conversation_id, &server).await;
        self.tombstones.lock().await.remove(&server_id);
        match result {
            Ok(()) => {
                info!("Deleted {} from {}", server, conversation_id);
                Ok(())
            }
            Err(e) => {
                warn!("Delete of {} failed: {}", server, e);
                if removed.id.is_temp() {
                    removed.id = server_id.clone();
                    removed.status = DeliveryStatus::Sent;
                }
                self.store.reinsert(conversation_id, index, removed).await;
                self.rolled_back(conversation_id, &server_id);
                Err(e)
            }
        }
    }

    /// Forget every pending send and mapping (session end)
    pub async fn reset(&self) {
        self.pending.lock().await.clear();
        self.reconciled.lock().await.clear();
        self.tombstones.lock().await.clear();
        self.reactions.lock().await.clear();
    }

    fn changed(&self, conversation_id: &str) {
        self.events.emit(EngineEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
    }

    fn rolled_back(&self, conversation_id: &str, message_id: &MessageId) {
        self.events.emit(EngineEvent::MutationRolledBack {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.as_str().to_string(),
        });
        self.changed(conversation_id);
    }
}
