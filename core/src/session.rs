/// Signed-in user identity shared by every component
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

pub type UserId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(SyncError::Session("user id must not be empty".to_string()));
        }
        let display_name = display_name.into();
        let display_name = if display_name.trim().is_empty() {
            user_id.clone()
        } else {
            display_name
        };
        Ok(Self {
            user_id,
            display_name,
        })
    }

    pub fn is_me(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}
