use std::collections::BTreeMap;
use std::sync::Arc;

use super::answers::{AnswerStore, AnswerValue};
use super::gating::{self, StepIssue};
use super::sequencer;
use super::types::{FlowDefinition, FlowVariant, Progress};
use crate::observability;

/// Session state owned by the auth collaborator. Read-only to the flow and
/// passed in fresh on every navigation decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub is_authenticated: bool,
    pub needs_onboarding: bool,
    pub subject_id: Option<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(subject_id: &str, needs_onboarding: bool) -> Self {
        Self {
            is_authenticated: true,
            needs_onboarding,
            subject_id: Some(subject_id.to_string()),
        }
    }

    /// Signed in with a stored patient profile.
    pub fn has_profile(&self) -> bool {
        self.is_authenticated && !self.needs_onboarding
    }
}

/// Policy outcome that replaces the next step with a blocking screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    GatingUpgradeRequired,
    SafetyKnockout,
}

impl std::fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GatingUpgradeRequired => write!(f, "gating-upgrade-required"),
            Self::SafetyKnockout => write!(f, "safety-knockout"),
        }
    }
}

/// Error from flow operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("step '{0}' not found")]
    StepNotFound(String),
    #[error("flow is blocked: {0}")]
    Blocked(BlockedReason),
    #[error("step '{step}' is incomplete: {issue}")]
    Incomplete { step: String, issue: StepIssue },
    #[error("a saved draft is waiting to be continued or discarded")]
    RecoveryPending,
    #[error("the flow has not been mounted yet")]
    NotMounted,
    #[error("flow '{0}' has no post-auth step")]
    NoAuthTarget(String),
}

/// Outcome of a navigation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Moved { from: String, to: String },
    /// Already at the boundary in that direction.
    Stayed,
}

/// A running intake flow.
#[derive(Debug, Clone)]
pub struct FlowInstance {
    definition: Arc<FlowDefinition>,
    current_step: String,
    answers: AnswerStore,
    blocked_reason: Option<BlockedReason>,
}

impl FlowInstance {
    pub fn new(definition: Arc<FlowDefinition>) -> Self {
        let current_step = definition.first_step().to_string();
        observability::metrics()
            .flows_started
            .with_label_values(&[&definition.name])
            .inc();
        Self {
            definition,
            current_step,
            answers: AnswerStore::new(),
            blocked_reason: None,
        }
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn variant(&self) -> FlowVariant {
        self.definition.variant
    }

    pub fn current_step(&self) -> &str {
        &self.current_step
    }

    pub fn answers(&self) -> &AnswerStore {
        &self.answers
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        self.blocked_reason
    }

    pub fn is_at_first_step(&self) -> bool {
        self.definition.is_first(&self.current_step)
    }

    pub fn is_at_last_step(&self) -> bool {
        self.definition.is_last(&self.current_step)
    }

    pub fn progress(&self) -> Option<Progress<'_>> {
        self.definition.progress(&self.current_step)
    }

    /// Set one answer and re-evaluate blocking over the full answer set.
    pub fn set_answer(&mut self, field: &str, value: impl Into<AnswerValue>) -> Option<BlockedReason> {
        self.answers.set(field, value);
        self.reevaluate_block()
    }

    /// Bulk-restore typed answers (merge).
    pub fn restore(&mut self, values: BTreeMap<String, AnswerValue>) -> Option<BlockedReason> {
        self.answers.merge(values);
        self.reevaluate_block()
    }

    /// Bulk-restore raw JSON from a draft or transfer slot (merge, unknown
    /// keys ignored).
    pub fn restore_json(
        &mut self,
        raw: &serde_json::Map<String, serde_json::Value>,
    ) -> usize {
        let known = self.definition.known_fields();
        let taken = self.answers.merge_json(raw, &known);
        self.reevaluate_block();
        taken
    }

    /// Drop every answer and return to the first step.
    pub fn reset(&mut self) {
        self.answers.clear();
        self.blocked_reason = None;
        self.current_step = self.definition.first_step().to_string();
    }

    fn reevaluate_block(&mut self) -> Option<BlockedReason> {
        let reason = gating::blocked_reason(&self.definition, &self.answers);
        if let Some(r) = reason {
            if self.blocked_reason != Some(r) {
                tracing::info!(
                    "flow '{}' blocked at step '{}': {r}",
                    self.definition.name,
                    self.current_step
                );
                observability::metrics()
                    .blocks
                    .with_label_values(&[&self.definition.name, &r.to_string()])
                    .inc();
            }
        }
        self.blocked_reason = reason;
        reason
    }

    /// Validation result for the current step.
    pub fn check_current(&self, auth: &AuthContext) -> Result<(), StepIssue> {
        gating::check_step(&self.definition, &self.current_step, &self.answers, auth)
    }

    pub fn can_continue(&self, auth: &AuthContext) -> bool {
        self.blocked_reason.is_none() && self.check_current(auth).is_ok()
    }

    /// Advance one step, applying skip rules for the given auth state.
    pub fn next(&mut self, auth: &AuthContext) -> Result<Navigation, FlowError> {
        if let Some(moved) = self.revalidate(auth) {
            return Ok(moved);
        }
        if let Some(reason) = self.blocked_reason {
            return Err(FlowError::Blocked(reason));
        }
        self.check_current(auth).map_err(|issue| FlowError::Incomplete {
            step: self.current_step.clone(),
            issue,
        })?;
        match sequencer::next_step(&self.definition, &self.current_step, auth) {
            Some(target) => {
                let target = target.to_string();
                Ok(self.move_to(target))
            }
            None => Ok(Navigation::Stayed),
        }
    }

    /// Step back, skipping the same steps the forward walk skips.
    pub fn back(&mut self, auth: &AuthContext) -> Navigation {
        match sequencer::previous_step(&self.definition, &self.current_step, auth) {
            Some(target) => {
                let target = target.to_string();
                self.move_to(target)
            }
            None => Navigation::Stayed,
        }
    }

    /// Check that every step behind the current one still holds under the
    /// given auth state, and that the current step is still shown at all.
    /// Returns the corrective move when one was needed.
    pub fn revalidate(&mut self, auth: &AuthContext) -> Option<Navigation> {
        if let Some(target) = sequencer::first_unsatisfied_step(
            &self.definition,
            &self.answers,
            auth,
            &self.current_step,
        ) {
            let target = target.to_string();
            tracing::warn!(
                "flow '{}': step '{}' no longer satisfied at '{}', moving back",
                self.definition.name,
                target,
                self.current_step
            );
            return Some(self.move_to(target));
        }
        self.leave_skipped_step(auth)
    }

    /// Move off the current step when the skip rules hide it under `auth`:
    /// forward to the next visible step, or back when none is left.
    pub fn leave_skipped_step(&mut self, auth: &AuthContext) -> Option<Navigation> {
        let hidden = self
            .definition
            .step(&self.current_step)
            .is_some_and(|s| s.is_skipped(auth));
        if !hidden {
            return None;
        }
        let target = sequencer::next_step(&self.definition, &self.current_step, auth)
            .or_else(|| sequencer::previous_step(&self.definition, &self.current_step, auth))?
            .to_string();
        tracing::info!(
            "flow '{}': step '{}' is skipped for this patient, moving to '{target}'",
            self.definition.name,
            self.current_step
        );
        Some(self.move_to(target))
    }

    /// Jump straight to a step, e.g. when resuming a draft. The first step
    /// is treated as no progress and leaves the flow where it is.
    pub fn jump_to(&mut self, step_id: &str) -> Result<Navigation, FlowError> {
        if self.definition.position(step_id).is_none() {
            return Err(FlowError::StepNotFound(step_id.to_string()));
        }
        if self.definition.is_first(step_id) || self.current_step == step_id {
            return Ok(Navigation::Stayed);
        }
        Ok(self.move_to(step_id.to_string()))
    }

    /// Embedded auth finished: go straight to the post-auth step.
    pub fn complete_auth(&mut self, subject_id: &str, profile_id: &str) -> Result<Navigation, FlowError> {
        let target = self
            .definition
            .after_auth
            .clone()
            .ok_or_else(|| FlowError::NoAuthTarget(self.definition.name.clone()))?;
        tracing::info!(
            "flow '{}': auth completed for subject {subject_id} (profile {profile_id})",
            self.definition.name
        );
        self.jump_to(&target)
    }

    fn move_to(&mut self, target: String) -> Navigation {
        let from = std::mem::replace(&mut self.current_step, target.clone());
        tracing::debug!("flow '{}': {from} -> {target}", self.definition.name);
        observability::metrics()
            .transitions
            .with_label_values(&[&self.definition.name])
            .inc();
        Navigation::Moved { from, to: target }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::builtin_flows;

    fn rx() -> FlowInstance {
        let flows = builtin_flows().unwrap();
        FlowInstance::new(Arc::new(flows["prescription"].clone()))
    }

    #[test]
    fn starts_at_first_step() {
        let flow = rx();
        assert_eq!(flow.current_step(), "type");
        assert!(flow.is_at_first_step());
        assert_eq!(flow.variant(), FlowVariant::PrescriptionRepeat);
        assert!(flow.blocked_reason().is_none());
    }

    #[test]
    fn next_requires_valid_step() {
        let mut flow = rx();
        let auth = AuthContext::anonymous();
        let err = flow.next(&auth).unwrap_err();
        assert!(matches!(err, FlowError::Incomplete { ref step, .. } if step == "type"));
        flow.set_answer("rx_type", "repeat");
        let nav = flow.next(&auth).unwrap();
        assert_eq!(
            nav,
            Navigation::Moved {
                from: "type".into(),
                to: "medication".into()
            }
        );
    }

    #[test]
    fn back_at_first_step_stays() {
        let mut flow = rx();
        assert_eq!(flow.back(&AuthContext::anonymous()), Navigation::Stayed);
    }

    #[test]
    fn blocked_flow_refuses_next_but_allows_back() {
        let mut flow = rx();
        let auth = AuthContext::anonymous();
        flow.set_answer("rx_type", "repeat");
        flow.next(&auth).unwrap();
        let blocked = flow.set_answer("prescribed_before", false);
        assert_eq!(blocked, Some(BlockedReason::GatingUpgradeRequired));
        assert_eq!(
            flow.next(&auth),
            Err(FlowError::Blocked(BlockedReason::GatingUpgradeRequired))
        );
        assert!(!flow.can_continue(&auth));
        assert!(matches!(flow.back(&auth), Navigation::Moved { .. }));
    }

    #[test]
    fn jump_to_first_step_is_a_noop() {
        let mut flow = rx();
        flow.set_answer("rx_type", "repeat");
        flow.next(&AuthContext::anonymous()).unwrap();
        assert_eq!(flow.jump_to("type").unwrap(), Navigation::Stayed);
        assert_eq!(flow.current_step(), "medication");
        assert_eq!(
            flow.jump_to("nowhere"),
            Err(FlowError::StepNotFound("nowhere".into()))
        );
    }

    #[test]
    fn complete_auth_lands_on_review() {
        let mut flow = rx();
        flow.complete_auth("subject-1", "profile-1").unwrap();
        assert_eq!(flow.current_step(), "review");
    }

    #[test]
    fn next_leaves_step_hidden_by_new_auth() {
        let mut flow = rx();
        let anon = AuthContext::anonymous();
        flow.set_answer("rx_type", "repeat");
        flow.jump_to("medicare").unwrap();
        assert!(flow.revalidate(&anon).is_some());
        assert_eq!(flow.current_step(), "medication");

        let mut flow = rx();
        flow.jump_to("signup").unwrap();
        let profile = AuthContext::signed_in("p", false);
        assert_eq!(
            flow.leave_skipped_step(&profile),
            Some(Navigation::Moved {
                from: "signup".into(),
                to: "review".into()
            })
        );
        assert_eq!(flow.leave_skipped_step(&profile), None);
    }

    #[test]
    fn reset_clears_answers() {
        let mut flow = rx();
        flow.set_answer("rx_type", "repeat");
        flow.next(&AuthContext::anonymous()).unwrap();
        flow.set_answer("prescribed_before", false);
        flow.reset();
        assert!(flow.answers().is_empty());
        assert!(flow.blocked_reason().is_none());
        assert!(flow.is_at_first_step());
    }
}
