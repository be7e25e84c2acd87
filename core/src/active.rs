/// Tracks which conversation the user is looking at
///
/// The active conversation is exempt from unread counts and is marked read on
/// activation; presence flags are written best-effort.
use crate::backend::RealtimeFeed;
use crate::digest::DigestAggregator;
use crate::error::Result;
use crate::model::ConversationId;
use crate::session::SessionIdentity;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct ActiveConversationTracker {
    feed: Arc<dyn RealtimeFeed>,
    digest: Arc<DigestAggregator>,
    session: SessionIdentity,
    /// Held for the whole switch so activations apply in call order
    active: Mutex<Option<ConversationId>>,
}

impl ActiveConversationTracker {
    pub fn new(
        feed: Arc<dyn RealtimeFeed>,
        digest: Arc<DigestAggregator>,
        session: SessionIdentity,
    ) -> Self {
        Self {
            feed,
            digest,
            session,
            active: Mutex::new(None),
        }
    }

    /// Switch focus; `None` clears it
    ///
    /// Only the mark-read failure is returned. Presence writes are logged.
    pub async fn set_active(&self, conversation_id: Option<&str>) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.as_deref() == conversation_id {
            debug!("Conversation {:?} already active", conversation_id);
            return Ok(());
        }

        if let Some(previous) = active.take() {
            if let Err(e) = self
                .feed
                .set_presence(&self.session.user_id, &previous, false)
                .await
            {
                warn!("Failed to clear presence in {}: {}", previous, e);
            }
            self.digest.clear_exempt(&previous).await;
            debug!("Deactivated {}", previous);
        }

        let Some(next) = conversation_id else {
            return Ok(());
        };
        *active = Some(next.to_string());
        self.digest.set_exempt(next).await;
        if let Err(e) = self
            .feed
            .set_presence(&self.session.user_id, next, true)
            .await
        {
            warn!("Failed to set presence in {}: {}", next, e);
        }
        info!("Active conversation is now {}", next);

        self.digest.mark_conversation_read(next).await
    }

    pub async fn active(&self) -> Option<ConversationId> {
        self.active.lock().await.clone()
    }
}
