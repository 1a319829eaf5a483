use super::*;

#[test]
fn fresh_form_starts_unlocked_with_all_toggles_off() {
    let form = PresenceForm::from_server(None);
    assert!(!form.is_locked());
    assert!(!form.am());
    assert!(!form.pm());
    assert!(!form.not_coming());
    assert!(form.error().is_none());
}

#[test]
fn existing_record_locks_the_form_with_its_values() {
    let form = PresenceForm::from_server(Some((true, false)));
    assert!(form.is_locked());
    assert!(form.am());
    assert!(!form.pm());
    assert!(!form.not_coming());

    let absent = PresenceForm::from_server(Some((false, false)));
    assert!(absent.is_locked());
    assert!(absent.not_coming());
}

#[test]
fn not_coming_is_recomputed_after_every_period_toggle() {
    let sequences: &[&[fn(&mut PresenceForm)]] = &[
        &[PresenceForm::toggle_morning],
        &[PresenceForm::toggle_morning, PresenceForm::toggle_morning],
        &[PresenceForm::toggle_afternoon, PresenceForm::toggle_morning],
        &[
            PresenceForm::toggle_morning,
            PresenceForm::toggle_afternoon,
            PresenceForm::toggle_morning,
            PresenceForm::toggle_afternoon,
        ],
    ];

    for sequence in sequences {
        let mut form = PresenceForm::from_server(None);
        for step in *sequence {
            step(&mut form);
            assert_eq!(
                form.not_coming(),
                !form.am() && !form.pm(),
                "invariant must hold after every period toggle"
            );
        }
    }
}

#[test]
fn picking_a_period_clears_not_coming() {
    let mut form = PresenceForm::from_server(None);
    form.toggle_not_coming();
    assert!(form.not_coming());

    form.toggle_morning();
    assert!(form.am());
    assert!(!form.not_coming());
}

#[test]
fn turning_on_not_coming_forces_both_periods_off() {
    let mut form = PresenceForm::from_server(None);
    form.toggle_morning();
    form.toggle_afternoon();
    assert!(form.am() && form.pm());

    form.toggle_not_coming();
    assert!(form.not_coming());
    assert!(!form.am());
    assert!(!form.pm());
}

#[test]
fn turning_off_not_coming_does_not_restore_periods() {
    let mut form = PresenceForm::from_server(None);
    form.toggle_morning();
    form.toggle_not_coming();
    form.toggle_not_coming();

    // All three stay off until the user explicitly picks a period again.
    assert!(!form.am());
    assert!(!form.pm());
    assert!(!form.not_coming());
}

#[test]
fn submit_payload_rederives_against_not_coming() {
    let mut form = PresenceForm::from_server(None);
    form.toggle_morning();
    let selection = form.begin_submit().expect("selection");
    assert_eq!(selection, PresenceSelection { am: true, pm: false });
}

#[test]
fn submit_is_a_noop_while_pending() {
    let mut form = PresenceForm::from_server(None);
    form.toggle_morning();
    assert!(form.begin_submit().is_some());
    assert!(form.is_pending());

    assert!(form.begin_submit().is_none());
    // Toggles are ignored while the round trip is in flight.
    form.toggle_afternoon();
    assert!(!form.pm());
}

#[test]
fn successful_submit_locks_the_form() {
    let mut form = PresenceForm::from_server(None);
    form.toggle_morning();
    form.begin_submit().expect("selection");
    form.submit_succeeded();

    assert!(form.is_locked());
    assert!(!form.is_pending());
    assert!(form.am());
    assert!(form.begin_submit().is_none());
}

#[test]
fn failed_submit_stays_unlocked_and_preserves_selections() {
    let mut form = PresenceForm::from_server(None);
    form.toggle_morning();
    form.toggle_afternoon();
    form.begin_submit().expect("selection");
    form.submit_failed("store rejected the write");

    assert!(!form.is_locked());
    assert!(!form.is_pending());
    assert!(form.am() && form.pm());
    assert_eq!(form.error(), Some("store rejected the write"));

    // Retry clears the surfaced message.
    form.begin_submit().expect("retry");
    assert!(form.error().is_none());
}

#[test]
fn unlock_preserves_the_last_known_values() {
    let mut form = PresenceForm::from_server(Some((true, false)));
    form.request_unlock();

    assert!(!form.is_locked());
    assert!(form.am());
    assert!(!form.pm());
    assert!(!form.not_coming());
}

#[test]
fn toggles_and_unlock_respect_the_lock() {
    let mut form = PresenceForm::from_server(Some((true, true)));
    form.toggle_morning();
    form.toggle_not_coming();
    assert!(form.am() && form.pm());
    assert!(form.begin_submit().is_none());

    // Unlock on an unlocked form is equally inert.
    let mut unlocked = PresenceForm::from_server(None);
    unlocked.request_unlock();
    assert!(!unlocked.is_locked());
}
