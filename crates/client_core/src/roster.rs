//! The displayed teammate list and the reducer that keeps it in sync with the
//! realtime change feed.
//!
//! The list is seeded once from a server snapshot and then only ever mutated
//! through [`PresenceRoster::apply`]: a pure `(list, change) -> list` step
//! with no network dependency, so delivery-order quirks can be tested
//! directly.

use shared::{
    domain::{ChangeKind, UserId},
    protocol::{PresenceEntry, PresencePayload, ProfilePayload},
};

pub const UNNAMED_TEAMMATE: &str = "Unnamed teammate";

#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub user_id: UserId,
    pub am: bool,
    pub pm: bool,
    pub profile: Option<ProfilePayload>,
}

impl RosterEntry {
    pub fn from_presence(presence: &PresencePayload, profile: Option<ProfilePayload>) -> Self {
        Self {
            user_id: presence.user_id,
            am: presence.am,
            pm: presence.pm,
            profile,
        }
    }

    /// Render rule: both periods off means "not coming". Such entries stay in
    /// the list, shown muted with a "Not coming" badge.
    pub fn is_not_coming(&self) -> bool {
        !self.am && !self.pm
    }

    pub fn display_name(&self) -> String {
        let profile = self.profile.as_ref();
        let first = profile.and_then(|p| p.first_name.as_deref()).unwrap_or("");
        let last = profile.and_then(|p| p.last_name.as_deref()).unwrap_or("");
        match (first.is_empty(), last.is_empty()) {
            (true, true) => UNNAMED_TEAMMATE.to_string(),
            (false, true) => first.to_string(),
            (true, false) => last.to_string(),
            (false, false) => format!("{first} {last}"),
        }
    }
}

impl From<PresenceEntry> for RosterEntry {
    fn from(entry: PresenceEntry) -> Self {
        Self {
            user_id: entry.user_id,
            am: entry.am,
            pm: entry.pm,
            profile: entry.profile,
        }
    }
}

/// One entry per user, in seed order followed by first-seen order. Updates
/// replace in place and never reshuffle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceRoster {
    entries: Vec<RosterEntry>,
}

impl PresenceRoster {
    pub fn seed(snapshot: impl IntoIterator<Item = PresenceEntry>) -> Self {
        Self {
            entries: snapshot.into_iter().map(RosterEntry::from).collect(),
        }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges one change event. Insert and Update share upsert semantics:
    /// events can arrive out of causal order, so an Update for an unseen user
    /// must land exactly like an Insert. Delete on an absent user is a no-op.
    pub fn apply(&mut self, kind: ChangeKind, entry: RosterEntry) {
        match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                match self
                    .entries
                    .iter_mut()
                    .find(|existing| existing.user_id == entry.user_id)
                {
                    Some(existing) => *existing = entry,
                    None => self.entries.push(entry),
                }
            }
            ChangeKind::Delete => {
                self.entries.retain(|existing| existing.user_id != entry.user_id);
            }
        }
    }

    /// Attaches later-arriving profile data without touching presence flags
    /// or position. Unknown users are ignored; they will carry the profile
    /// whenever their presence event shows up.
    pub fn update_profile(&mut self, user_id: UserId, profile: ProfilePayload) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.user_id == user_id)
        {
            Some(existing) => {
                existing.profile = Some(profile);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;
