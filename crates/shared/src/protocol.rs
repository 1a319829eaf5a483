use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChangeKind, PresenceId, UserId},
    error::ApiError,
};

/// A persisted presence row as it travels over the wire. At most one exists
/// per (user, day); "not coming" is encoded as both flags false, never as a
/// separate variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub presence_id: PresenceId,
    pub user_id: UserId,
    pub day: NaiveDate,
    pub am: bool,
    pub pm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// One displayed row of the teammate list: presence flags plus whatever
/// profile data the enrichment lookup could attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub am: bool,
    pub pm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfilePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertPresenceRequest {
    pub user_id: UserId,
    /// Defaults to today (UTC) when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<NaiveDate>,
    pub am: bool,
    pub pm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscriptionPayload {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    PresenceChanged {
        kind: ChangeKind,
        presence: PresencePayload,
    },
    ProfileUpdated {
        user_id: UserId,
        profile: ProfilePayload,
    },
    Error(ApiError),
}
