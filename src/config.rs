use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Supplies the current auth token attached to the stream request and to
/// topic-sync submissions. Consulted on every outgoing request, so token
/// refreshes elsewhere in the SDK take effect on the next reconnect or sync.
pub trait AuthTokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl AuthTokenSource for String {
    fn token(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.clone())
        }
    }
}

impl AuthTokenSource for Option<String> {
    fn token(&self) -> Option<String> {
        self.as_ref().and_then(|token| token.token())
    }
}

impl<F> AuthTokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

pub(crate) type AuthSlot = Arc<RwLock<Option<Arc<dyn AuthTokenSource>>>>;

pub(crate) fn token_of(slot: &AuthSlot) -> Option<String> {
    slot.read().unwrap().as_ref().and_then(|source| source.token())
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Delay before the first reconnect attempt; doubles per consecutive
    /// failure up to `max_delay`.
    pub base_delay: Duration,
    /// Backoff ceiling, before jitter.
    pub max_delay: Duration,
    /// Budget for opening the stream and receiving the connect frame.
    pub connect_timeout: Duration,
    /// Window within which registry churn collapses into one topic sync.
    pub sync_debounce: Duration,
    /// How long an empty registry is tolerated before the stream is torn
    /// down. Absorbs rapid subscribe/unsubscribe churn.
    pub idle_grace: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            sync_debounce: Duration::from_millis(50),
            idle_grace: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RealtimeConfig::default();
        assert!(config.base_delay < config.max_delay);
        assert!(config.sync_debounce < config.idle_grace);
    }

    #[test]
    fn test_string_token_source() {
        let empty = String::new();
        assert_eq!(empty.token(), None);

        let token = "abc123".to_string();
        assert_eq!(token.token(), Some("abc123".to_string()));
    }

    #[test]
    fn test_option_token_source() {
        let absent: Option<String> = None;
        assert_eq!(absent.token(), None);
        assert_eq!(Some(String::new()).token(), None);
        assert_eq!(
            Some("abc123".to_string()).token(),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn test_closure_token_source() {
        let source = || Some("from-closure".to_string());
        assert_eq!(source.token(), Some("from-closure".to_string()));
    }
}
