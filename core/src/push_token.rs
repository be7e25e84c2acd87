/// Push notification token registration
///
/// A token registered within the cooldown is reused without a network call;
/// concurrent `enable` calls for one user share a single registration.
use crate::backend::PushRegistrar;
use crate::cache::LocalCache;
use crate::coalesce::InFlight;
use crate::error::Result;
use crate::model::UserId;
use crate::utils::within;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CACHE_PREFIX: &str = "push_token:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenRegistration {
    token: String,
    registered_at: DateTime<Utc>,
}

pub struct PushTokenManager {
    registrar: Arc<dyn PushRegistrar>,
    cache: LocalCache,
    cooldown: Duration,
    registrations: RwLock<HashMap<UserId, TokenRegistration>>,
    flights: InFlight<UserId, Result<TokenRegistration>>,
}

impl PushTokenManager {
    pub fn new(registrar: Arc<dyn PushRegistrar>, cache: LocalCache, cooldown: Duration) -> Self {
        Self {
            registrar,
            cache,
            cooldown,
            registrations: RwLock::new(HashMap::new()),
            flights: InFlight::new(),
        }
    }

    fn cache_key(user_id: &str) -> String {
        format!("{}{}", CACHE_PREFIX, user_id)
    }

    /// Restore a persisted registration so a restart stays inside the cooldown
    pub async fn initialize(&self, user_id: &str) -> Result<()> {
        if let Some(registration) = self.cache.get::<TokenRegistration>(&Self::cache_key(user_id))? {
            debug!("Restored push token for {} from {}", user_id, registration.registered_at);
            self.registrations
                .write()
                .await
                .insert(user_id.to_string(), registration);
        }
        Ok(())
    }

    pub async fn enable(&self, user_id: &str) -> EnableOutcome {
        let previous = self.registrations.read().await.get(user_id).cloned();
        if let Some(registration) = &previous {
            if within(registration.registered_at, self.cooldown) {
                debug!("Push token for {} still fresh", user_id);
                return EnableOutcome {
                    success: true,
                    message: "Notifications already enabled".to_string(),
                };
            }
        }

        let registrar = self.registrar.clone();
        let owner = user_id.to_string();
        let result = self
            .flights
            .run(user_id.to_string(), move || async move {
                registrar
                    .register_token(&owner)
                    .await
                    .map(|token| TokenRegistration {
                        token,
                        registered_at: Utc::now(),
                    })
            })
            .await;

        match result {
            Ok(registration) => {
                let replaced = {
                    let mut registrations = self.registrations.write().await;
                    registrations.insert(user_id.to_string(), registration.clone())
                };
                if let Err(e) = self.cache.put(&Self::cache_key(user_id), &registration) {
                    warn!("Failed to persist push token: {}", e);
                }
                if let Some(old) = replaced.filter(|old| old.token != registration.token) {
                    if let Err(e) = self.registrar.unregister_token(&old.token).await {
                        warn!("Failed to unregister stale push token: {}", e);
                    }
                }
                info!("Push notifications enabled for {}", user_id);
                EnableOutcome {
                    success: true,
                    message: "Notifications enabled".to_string(),
                }
            }
            Err(e) => {
                warn!("Push token registration for {} failed: {}", user_id, e);
                EnableOutcome {
                    success: false,
                    message: e.to_string(),
                }
            }
        }
    }

    pub async fn is_enabled(&self, user_id: &str) -> bool {
        self.registrations.read().await.contains_key(user_id)
    }

    /// Unregister every token and forget all cooldowns (logout)
    pub async fn reset(&self) {
        let registrations: Vec<TokenRegistration> = self
            .registrations
            .write()
            .await
            .drain()
            .map(|(_, r)| r)
            .collect();
        for registration in &registrations {
            if let Err(e) = self.registrar.unregister_token(&registration.token).await {
                warn!("Failed to unregister push token: {}", e);
            }
        }
        match self.cache.clear_prefix(CACHE_PREFIX) {
            Ok(cleared) => debug!("Cleared {} cached push tokens", cleared),
            Err(e) => warn!("Failed to clear cached push tokens: {}", e),
        }
        info!("Push token state reset ({} unregistered)", registrations.len());
    }
}
