use std::time::Duration;

use reqwest::Client;
use shared::domain::UserId;
use storage::Storage;
use tracing::{info, warn};

const DEFAULT_ACTOR: &str = "A teammate";

/// Fire-and-forget push fan-out after a presence change. Delivery is a
/// secondary channel: every failure is swallowed and logged, and can never
/// affect the submit that triggered it.
#[derive(Clone)]
pub struct PushDispatcher {
    http: Client,
    enabled: bool,
}

impl PushDispatcher {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, enabled }
    }

    /// Notifies every subscribed teammate except the actor. Endpoints that
    /// report themselves gone are dropped from the store.
    pub async fn notify_presence_change(&self, storage: &Storage, actor: UserId, am: bool, pm: bool) {
        if !self.enabled {
            return;
        }

        let subscriptions = match storage.list_push_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!(%err, "push: failed to list subscriptions");
                return;
            }
        };
        if subscriptions.is_empty() {
            return;
        }

        let actor_name = self.actor_name(storage, actor).await;
        let body = notification_body(&actor_name, am, pm);
        let payload = serde_json::json!({
            "title": "Presence updated",
            "body": body,
            "data": { "url": "/" },
        });

        let mut delivered = 0usize;
        for subscription in subscriptions
            .into_iter()
            .filter(|s| s.user_id != actor)
        {
            let response = self
                .http
                .post(&subscription.endpoint)
                .json(&payload)
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => delivered += 1,
                Ok(response)
                    if response.status() == reqwest::StatusCode::NOT_FOUND
                        || response.status() == reqwest::StatusCode::GONE =>
                {
                    // Expired subscription: forget it.
                    if let Err(err) = storage.delete_push_subscription(&subscription.endpoint).await
                    {
                        warn!(%err, endpoint = %subscription.endpoint, "push: failed to drop dead subscription");
                    }
                }
                Ok(response) => {
                    warn!(status = %response.status(), endpoint = %subscription.endpoint, "push: delivery rejected");
                }
                Err(err) => {
                    warn!(%err, endpoint = %subscription.endpoint, "push: delivery failed");
                }
            }
        }
        info!(actor = actor.0, delivered, "push: presence change fan-out done");
    }

    async fn actor_name(&self, storage: &Storage, actor: UserId) -> String {
        let profile = match storage.profile_for_user(actor).await {
            Ok(profile) => profile,
            Err(_) => None,
        };
        let Some(profile) = profile else {
            return DEFAULT_ACTOR.to_string();
        };
        match (profile.first_name, profile.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first,
            _ => DEFAULT_ACTOR.to_string(),
        }
    }
}

fn notification_body(actor: &str, am: bool, pm: bool) -> String {
    let status = match (am, pm) {
        (true, true) => "here in the morning and here in the afternoon",
        (true, false) => "here in the morning",
        (false, true) => "here in the afternoon",
        (false, false) => "not coming today",
    };
    format!("{actor} is {status}.")
}
