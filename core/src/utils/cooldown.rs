/// Cooldown window checks over persisted timestamps
use chrono::{DateTime, Utc};
use std::time::Duration;

/// True while less than `window` has passed since `at`
pub fn within(at: DateTime<Utc>, window: Duration) -> bool {
    match (Utc::now() - at).to_std() {
        Ok(elapsed) => elapsed < window,
        // Timestamp in the future: treat as just now
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_cooldown() {
        assert!(within(Utc::now(), Duration::from_secs(30)));
        assert!(!within(Utc::now() - chrono::Duration::seconds(31), Duration::from_secs(30)));
        assert!(within(Utc::now() + chrono::Duration::seconds(10), Duration::from_secs(1)));
    }
}
