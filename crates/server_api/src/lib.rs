use chrono::{NaiveDate, Utc};
use shared::{
    domain::{ChangeKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        PresenceEntry, PresencePayload, ProfilePayload, PushSubscriptionPayload, ServerEvent,
        UpsertPresenceRequest,
    },
};
use storage::{Storage, StoredPresence, StoredProfile};

const MAX_NOTE_CHARS: usize = 500;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Validates and persists a presence submission for the calling user, one row
/// per (user, day). Returns the change event to broadcast plus the entry as
/// the list displays it.
pub async fn upsert_presence(
    ctx: &ApiContext,
    request: UpsertPresenceRequest,
) -> Result<(ServerEvent, PresenceEntry), ApiError> {
    ensure_authenticated(ctx, request.user_id).await?;

    let note = normalize_note(request.note.as_deref())?;
    let day = request.day.unwrap_or_else(today);

    let (stored, created) = ctx
        .storage
        .upsert_presence(request.user_id, day, request.am, request.pm, note.as_deref())
        .await
        .map_err(internal)?;

    let kind = if created {
        ChangeKind::Insert
    } else {
        ChangeKind::Update
    };
    let profile = ctx
        .storage
        .profile_for_user(request.user_id)
        .await
        .map_err(internal)?;

    let entry = PresenceEntry {
        user_id: stored.user_id,
        am: stored.am,
        pm: stored.pm,
        profile: profile.map(profile_payload),
    };
    let event = ServerEvent::PresenceChanged {
        kind,
        presence: presence_payload(stored),
    };
    Ok((event, entry))
}

/// Lock-state seed for the submitting user's own form at page load.
pub async fn my_presence(
    ctx: &ApiContext,
    user_id: UserId,
    day: NaiveDate,
) -> Result<Option<PresencePayload>, ApiError> {
    ensure_authenticated(ctx, user_id).await?;
    let presence = ctx
        .storage
        .presence_for(user_id, day)
        .await
        .map_err(internal)?;
    Ok(presence.map(presence_payload))
}

/// Snapshot of everyone's presence for the day, profiles joined in, in
/// insertion order. This is the one-time seed the list reconciler starts from.
pub async fn today_roster(ctx: &ApiContext, day: NaiveDate) -> Result<Vec<PresenceEntry>, ApiError> {
    let rows = ctx
        .storage
        .list_presences_for_day(day)
        .await
        .map_err(internal)?;
    Ok(rows
        .into_iter()
        .map(|(presence, profile)| PresenceEntry {
            user_id: presence.user_id,
            am: presence.am,
            pm: presence.pm,
            profile: profile.map(profile_payload),
        })
        .collect())
}

/// Fixture/admin-only removal. Returns the Delete event when a row was
/// actually removed; absence is not an error.
pub async fn remove_presence(
    ctx: &ApiContext,
    user_id: UserId,
    day: NaiveDate,
) -> Result<Option<ServerEvent>, ApiError> {
    ensure_authenticated(ctx, user_id).await?;
    let existing = ctx
        .storage
        .presence_for(user_id, day)
        .await
        .map_err(internal)?;
    let Some(existing) = existing else {
        return Ok(None);
    };
    ctx.storage
        .delete_presence(user_id, day)
        .await
        .map_err(internal)?;
    Ok(Some(ServerEvent::PresenceChanged {
        kind: ChangeKind::Delete,
        presence: presence_payload(existing),
    }))
}

pub async fn update_profile(
    ctx: &ApiContext,
    user_id: UserId,
    profile: ProfilePayload,
) -> Result<ServerEvent, ApiError> {
    ensure_authenticated(ctx, user_id).await?;
    let stored = ctx
        .storage
        .upsert_profile(
            user_id,
            trimmed(profile.first_name.as_deref()),
            trimmed(profile.last_name.as_deref()),
            trimmed(profile.avatar_url.as_deref()),
        )
        .await
        .map_err(internal)?;
    Ok(ServerEvent::ProfileUpdated {
        user_id,
        profile: profile_payload(stored),
    })
}

/// Enrichment lookup used by realtime consumers when a change event arrives
/// without profile data.
pub async fn profile_for(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Option<ProfilePayload>, ApiError> {
    let profile = ctx
        .storage
        .profile_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(profile.map(profile_payload))
}

pub async fn subscribe_push(
    ctx: &ApiContext,
    user_id: UserId,
    subscription: PushSubscriptionPayload,
) -> Result<(), ApiError> {
    ensure_authenticated(ctx, user_id).await?;
    if subscription.endpoint.trim().is_empty()
        || subscription.p256dh.trim().is_empty()
        || subscription.auth.trim().is_empty()
    {
        return Err(ApiError::validation("invalid subscription"));
    }
    ctx.storage
        .save_push_subscription(
            user_id,
            &subscription.endpoint,
            &subscription.p256dh,
            &subscription.auth,
        )
        .await
        .map_err(internal)?;
    Ok(())
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn normalize_note(note: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if note.chars().count() > MAX_NOTE_CHARS {
        return Err(ApiError::validation(format!(
            "note exceeds {MAX_NOTE_CHARS} characters"
        )));
    }
    Ok(Some(note.to_string()))
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

async fn ensure_authenticated(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    let known = ctx.storage.user_exists(user_id).await.map_err(internal)?;
    if !known {
        return Err(ApiError::new(ErrorCode::Unauthorized, "not authenticated"));
    }
    Ok(())
}

fn presence_payload(stored: StoredPresence) -> PresencePayload {
    PresencePayload {
        presence_id: stored.presence_id,
        user_id: stored.user_id,
        day: stored.day,
        am: stored.am,
        pm: stored.pm,
        note: stored.note,
        updated_at: stored.updated_at,
    }
}

fn profile_payload(stored: StoredProfile) -> ProfilePayload {
    ProfilePayload {
        first_name: stored.first_name,
        last_name: stored.last_name,
        avatar_url: stored.avatar_url,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
