//! The daily presence form: three toggles feeding one boolean pair, gated by
//! a lock once today's answer has been submitted.
//!
//! "Not coming" is carried as its own flag next to the derived value
//! `!am && !pm`. Every period toggle recomputes the flag, while the not-coming
//! button sets it directly; the two paths are kept consistent here and
//! re-derived once more at submit time so "not coming" always wins.

/// The boolean pair that actually gets persisted. "Not coming" is encoded as
/// both false, never as a third value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSelection {
    pub am: bool,
    pub pm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSnapshot {
    pub am: bool,
    pub pm: bool,
    pub not_coming: bool,
    pub locked: bool,
    pub pending: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceForm {
    am: bool,
    pm: bool,
    not_coming: bool,
    locked: bool,
    pending: bool,
    error: Option<String>,
}

impl Default for PresenceForm {
    fn default() -> Self {
        Self::from_server(None)
    }
}

impl PresenceForm {
    /// Builds the initial state from the server's record for today. A known
    /// record locks the form with its values as the summary; no record means
    /// an editable blank form with all three toggles off.
    pub fn from_server(initial: Option<(bool, bool)>) -> Self {
        match initial {
            Some((am, pm)) => Self {
                am,
                pm,
                not_coming: !am && !pm,
                locked: true,
                pending: false,
                error: None,
            },
            None => Self {
                am: false,
                pm: false,
                not_coming: false,
                locked: false,
                pending: false,
                error: None,
            },
        }
    }

    pub fn am(&self) -> bool {
        self.am
    }

    pub fn pm(&self) -> bool {
        self.pm
    }

    pub fn not_coming(&self) -> bool {
        self.not_coming
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn snapshot(&self) -> FormSnapshot {
        FormSnapshot {
            am: self.am,
            pm: self.pm,
            not_coming: self.not_coming,
            locked: self.locked,
            pending: self.pending,
            error: self.error.clone(),
        }
    }

    pub fn toggle_morning(&mut self) {
        if !self.editable() {
            return;
        }
        self.am = !self.am;
        self.recompute_not_coming();
    }

    pub fn toggle_afternoon(&mut self) {
        if !self.editable() {
            return;
        }
        self.pm = !self.pm;
        self.recompute_not_coming();
    }

    /// Flipping to "not coming" clears both periods. Flipping back does not
    /// restore them: all three stay off until a period is picked again.
    pub fn toggle_not_coming(&mut self) {
        if !self.editable() {
            return;
        }
        self.not_coming = !self.not_coming;
        if self.not_coming {
            self.am = false;
            self.pm = false;
        }
    }

    /// Starts a submission. Returns the payload to persist, or `None` when
    /// the form is locked or a previous submit is still in flight. The
    /// returned pair re-derives against `not_coming` so a stale flag can
    /// never persist a period.
    pub fn begin_submit(&mut self) -> Option<PresenceSelection> {
        if self.locked || self.pending {
            return None;
        }
        self.pending = true;
        self.error = None;
        Some(PresenceSelection {
            am: self.am && !self.not_coming,
            pm: self.pm && !self.not_coming,
        })
    }

    pub fn submit_succeeded(&mut self) {
        if !self.pending {
            return;
        }
        self.pending = false;
        self.locked = true;
        self.error = None;
    }

    /// Store and validation failures land here: the form stays editable, the
    /// user's selections are preserved and the message is surfaced.
    pub fn submit_failed(&mut self, message: impl Into<String>) {
        if !self.pending {
            return;
        }
        self.pending = false;
        self.error = Some(message.into());
    }

    /// "Update my presence": reopens a locked form with the last-known
    /// values as the editable starting point.
    pub fn request_unlock(&mut self) {
        if !self.locked || self.pending {
            return;
        }
        self.locked = false;
    }

    fn editable(&self) -> bool {
        !self.locked && !self.pending
    }

    fn recompute_not_coming(&mut self) {
        self.not_coming = !self.am && !self.pm;
    }
}

#[cfg(test)]
#[path = "tests/form_tests.rs"]
mod tests;
