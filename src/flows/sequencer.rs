//! Step sequencing over a definition's ordered step list.
//!
//! Forward and backward walks share the same skip predicates, so a step the
//! forward walk skips is also skipped going back.

use super::answers::AnswerStore;
use super::gating;
use super::state::AuthContext;
use super::types::FlowDefinition;

/// Step after `current`, skipping any step whose skip predicate holds.
/// `None` when `current` is unknown or there is nowhere left to go.
pub fn next_step<'a>(def: &'a FlowDefinition, current: &str, auth: &AuthContext) -> Option<&'a str> {
    let i = def.position(current)?;
    def.steps[i + 1..]
        .iter()
        .find(|s| !s.is_skipped(auth))
        .map(|s| s.id.as_str())
}

/// Mirror of [`next_step`] walking backwards.
pub fn previous_step<'a>(
    def: &'a FlowDefinition,
    current: &str,
    auth: &AuthContext,
) -> Option<&'a str> {
    let i = def.position(current)?;
    def.steps[..i]
        .iter()
        .rev()
        .find(|s| !s.is_skipped(auth))
        .map(|s| s.id.as_str())
}

/// Earliest step before `current` that the patient would have to pass
/// through under `auth` but whose answers no longer satisfy it. Catches
/// auth changes mid-flow (e.g. a session expiring after Medicare was
/// skipped).
pub fn first_unsatisfied_step<'a>(
    def: &'a FlowDefinition,
    answers: &AnswerStore,
    auth: &AuthContext,
    current: &str,
) -> Option<&'a str> {
    let i = def.position(current)?;
    def.steps[..i]
        .iter()
        .filter(|s| !s.is_skipped(auth))
        .find(|s| gating::check_step(def, &s.id, answers, auth).is_err())
        .map(|s| s.id.as_str())
}

/// Steps the patient will see under `auth`, in order.
pub fn visible_steps<'a>(def: &'a FlowDefinition, auth: &AuthContext) -> Vec<&'a str> {
    def.steps
        .iter()
        .filter(|s| !s.is_skipped(auth))
        .map(|s| s.id.as_str())
        .collect()
}
