use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use shared::{
    domain::{ChangeKind, UserId},
    error::ApiError,
    protocol::{PresencePayload, ProfilePayload, ServerEvent, UpsertPresenceRequest},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;

pub mod form;
pub mod roster;

pub use form::{FormSnapshot, PresenceForm, PresenceSelection};
pub use roster::{PresenceRoster, RosterEntry};

/// Secondary lookup used to attach names and avatars to presence events that
/// arrive without profile data. A failing lookup degrades the display, it
/// never blocks the merge.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn profile_for(&self, user_id: UserId) -> Result<Option<ProfilePayload>>;
}

/// Directory backed by the server's `/profiles/:user_id` endpoint.
pub struct HttpProfileDirectory {
    http: Client,
    server_url: String,
}

impl HttpProfileDirectory {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl ProfileDirectory for HttpProfileDirectory {
    async fn profile_for(&self, user_id: UserId) -> Result<Option<ProfilePayload>> {
        let response = self
            .http
            .get(format!("{}/profiles/{}", self.server_url, user_id.0))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let profile: ProfilePayload = response.error_for_status()?.json().await?;
        Ok(Some(profile))
    }
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("server_url must start with http:// or https://")]
    InvalidServerUrl,
    #[error("realtime feed already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    FormChanged(FormSnapshot),
    RosterChanged(Vec<RosterEntry>),
    Error(String),
}

struct ClientInner {
    server_url: Option<String>,
    user_id: Option<i64>,
    form: PresenceForm,
    roster: PresenceRoster,
}

/// Client-side presence session: owns the form state machine and the roster,
/// drives submits over HTTP and merges the server's WebSocket change feed.
pub struct PresenceClient {
    http: Client,
    profiles: Mutex<Option<Arc<dyn ProfileDirectory>>>,
    inner: Mutex<ClientInner>,
    realtime_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: i64,
}

impl PresenceClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            http: Client::new(),
            profiles: Mutex::new(None),
            inner: Mutex::new(ClientInner {
                server_url: None,
                user_id: None,
                form: PresenceForm::default(),
                roster: PresenceRoster::default(),
            }),
            realtime_task: Mutex::new(None),
            events,
        })
    }

    /// Replaces the enrichment lookup; by default an HTTP directory against
    /// the logged-in server is used.
    pub async fn set_profile_directory(&self, directory: Arc<dyn ProfileDirectory>) {
        *self.profiles.lock().await = Some(directory);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn login(&self, server_url: &str, username: &str) -> Result<UserId> {
        let response: LoginResponse = self
            .http
            .post(format!("{server_url}/login"))
            .json(&serde_json::json!({ "username": username }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let server_url = server_url.trim_end_matches('/').to_string();
        {
            let mut profiles = self.profiles.lock().await;
            if profiles.is_none() {
                *profiles = Some(Arc::new(HttpProfileDirectory {
                    http: self.http.clone(),
                    server_url: server_url.clone(),
                }));
            }
        }
        let mut guard = self.inner.lock().await;
        guard.server_url = Some(server_url);
        guard.user_id = Some(response.user_id);
        Ok(UserId(response.user_id))
    }

    /// Seeds the form from the caller's record for today (locking it when one
    /// exists) and the roster from the day's snapshot.
    pub async fn load_today(&self) -> Result<()> {
        let (server_url, user_id) = self.session().await?;
        let day = Utc::now().date_naive();

        let mine: Option<PresencePayload> = self
            .http
            .get(format!("{server_url}/presences/me"))
            .query(&[("user_id", user_id.to_string()), ("day", day.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let snapshot: Vec<shared::protocol::PresenceEntry> = self
            .http
            .get(format!("{server_url}/presences/today"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let (form_snapshot, entries) = {
            let mut guard = self.inner.lock().await;
            guard.form = PresenceForm::from_server(mine.map(|p| (p.am, p.pm)));
            guard.roster = PresenceRoster::seed(snapshot);
            (guard.form.snapshot(), guard.roster.entries().to_vec())
        };
        let _ = self.events.send(ClientEvent::FormChanged(form_snapshot));
        let _ = self.events.send(ClientEvent::RosterChanged(entries));
        Ok(())
    }

    pub async fn form_snapshot(&self) -> FormSnapshot {
        self.inner.lock().await.form.snapshot()
    }

    pub async fn roster_entries(&self) -> Vec<RosterEntry> {
        self.inner.lock().await.roster.entries().to_vec()
    }

    pub async fn toggle_morning(&self) {
        self.with_form(PresenceForm::toggle_morning).await;
    }

    pub async fn toggle_afternoon(&self) {
        self.with_form(PresenceForm::toggle_afternoon).await;
    }

    pub async fn toggle_not_coming(&self) {
        self.with_form(PresenceForm::toggle_not_coming).await;
    }

    pub async fn request_unlock(&self) {
        self.with_form(PresenceForm::request_unlock).await;
    }

    /// Submits the current selection. A no-op while a previous submit is
    /// pending or the form is locked. Failures stay on the form as a
    /// user-visible message; the lock state never changes on failure.
    pub async fn submit_presence(&self) -> Result<()> {
        let (server_url, user_id) = self.session().await?;

        let selection = {
            let mut guard = self.inner.lock().await;
            let selection = guard.form.begin_submit();
            if selection.is_some() {
                let snapshot = guard.form.snapshot();
                let _ = self.events.send(ClientEvent::FormChanged(snapshot));
            }
            selection
        };
        let Some(selection) = selection else {
            return Ok(());
        };

        let request = UpsertPresenceRequest {
            user_id: UserId(user_id),
            day: None,
            am: selection.am,
            pm: selection.pm,
            note: None,
        };
        let outcome = self.post_presence(&server_url, &request).await;

        let snapshot = {
            let mut guard = self.inner.lock().await;
            match outcome {
                Ok(()) => guard.form.submit_succeeded(),
                Err(message) => guard.form.submit_failed(message),
            }
            guard.form.snapshot()
        };
        if let Some(error) = &snapshot.error {
            let _ = self.events.send(ClientEvent::Error(error.clone()));
        }
        let _ = self.events.send(ClientEvent::FormChanged(snapshot));
        Ok(())
    }

    async fn post_presence(
        &self,
        server_url: &str,
        request: &UpsertPresenceRequest,
    ) -> std::result::Result<(), String> {
        let response = self
            .http
            .post(format!("{server_url}/presences"))
            .json(request)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        if response.status().is_success() {
            return Ok(());
        }
        match response.json::<ApiError>().await {
            Ok(api_error) => Err(api_error.message),
            Err(err) => Err(format!("invalid error response: {err}")),
        }
    }

    /// Connects the WebSocket change feed and merges events into the roster
    /// until [`stop_realtime`](Self::stop_realtime) is called.
    pub async fn start_realtime(self: &Arc<Self>) -> Result<()> {
        let (server_url, _user_id) = self.session().await?;

        {
            let guard = self.realtime_task.lock().await;
            if guard.is_some() {
                return Err(RealtimeError::AlreadyRunning.into());
            }
        }

        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}/ws")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}/ws")
        } else {
            return Err(RealtimeError::InvalidServerUrl.into());
        };
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.handle_server_event(event).await,
                        Err(err) => {
                            let _ = client
                                .events
                                .send(ClientEvent::Error(format!("invalid server event: {err}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client.events.send(ClientEvent::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        break;
                    }
                }
            }
        });

        *self.realtime_task.lock().await = Some(task);
        Ok(())
    }

    /// Tears down the subscription. In-flight submits are not aborted; their
    /// responses only touch the form, so nothing stale can reach the roster
    /// afterwards.
    pub async fn stop_realtime(&self) {
        if let Some(task) = self.realtime_task.lock().await.take() {
            task.abort();
        }
    }

    /// Merges one server event. Presence changes without embedded profile
    /// data go through the profile directory first; a failed lookup merges
    /// the entry anyway with the profile left absent.
    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::PresenceChanged { kind, presence } => {
                let profile = match kind {
                    ChangeKind::Delete => None,
                    ChangeKind::Insert | ChangeKind::Update => {
                        self.enrich(presence.user_id).await
                    }
                };
                let entry = RosterEntry::from_presence(&presence, profile);
                let entries = {
                    let mut guard = self.inner.lock().await;
                    guard.roster.apply(kind, entry);
                    guard.roster.entries().to_vec()
                };
                let _ = self.events.send(ClientEvent::RosterChanged(entries));
            }
            ServerEvent::ProfileUpdated { user_id, profile } => {
                let changed = {
                    let mut guard = self.inner.lock().await;
                    let changed = guard.roster.update_profile(user_id, profile);
                    (changed).then(|| guard.roster.entries().to_vec())
                };
                if let Some(entries) = changed {
                    let _ = self.events.send(ClientEvent::RosterChanged(entries));
                }
            }
            ServerEvent::Error(api_error) => {
                let _ = self.events.send(ClientEvent::Error(api_error.message));
            }
        }
    }

    async fn enrich(&self, user_id: UserId) -> Option<ProfilePayload> {
        let Some(directory) = self.profiles.lock().await.clone() else {
            return None;
        };
        match directory.profile_for(user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(user_id = user_id.0, %err, "profile enrichment failed, merging without profile");
                None
            }
        }
    }

    async fn session(&self) -> Result<(String, i64)> {
        let guard = self.inner.lock().await;
        let server_url = guard
            .server_url
            .clone()
            .ok_or_else(|| anyhow!("not logged in: missing server_url"))?;
        let user_id = guard
            .user_id
            .ok_or_else(|| anyhow!("not logged in: missing user_id"))?;
        Ok((server_url, user_id))
    }

    async fn with_form(&self, mutate: impl FnOnce(&mut PresenceForm)) {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            mutate(&mut guard.form);
            guard.form.snapshot()
        };
        let _ = self.events.send(ClientEvent::FormChanged(snapshot));
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
