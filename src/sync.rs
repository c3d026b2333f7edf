use crate::config::{token_of, AuthSlot};
use crate::error::RealtimeError;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::time::{Duration, Instant};
use url::Url;

#[derive(Serialize)]
struct SyncRequest<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
    subscriptions: &'a BTreeSet<String>,
}

/// Pushes the desired topic set to the server for a given client id.
pub(crate) struct TopicSync {
    http: reqwest::Client,
    endpoint: Url,
    auth: AuthSlot,
}

impl TopicSync {
    pub fn new(http: reqwest::Client, endpoint: Url, auth: AuthSlot) -> Self {
        Self {
            http,
            endpoint,
            auth,
        }
    }

    /// Associate the complete desired topic set with `client_id`. Always the
    /// full set, never a delta: a lost partial update must not leave the
    /// server's view drifted.
    pub async fn push(
        &self,
        client_id: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), RealtimeError> {
        tracing::debug!(client_id = %client_id, count = topics.len(), "syncing topic set");
        let mut request = self.http.post(self.endpoint.clone()).json(&SyncRequest {
            client_id,
            subscriptions: topics,
        });
        if let Some(token) = token_of(&self.auth) {
            request = request.header(AUTHORIZATION, token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Collapses a burst of registry changes into one pending sync deadline.
/// The first change opens the window; changes inside it do not push the
/// deadline out, so a sync fires at most `window` after the first change.
#[derive(Debug)]
pub(crate) struct SyncDebounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl SyncDebounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
