//! Per-step continue rules and flow-level blocking outcomes.
//!
//! Two independent decisions: whether the current step lets the patient
//! continue (`check_step`), and whether the answers so far force the flow
//! into a blocking screen (`blocked_reason`). Both are pure.

use chrono::NaiveDate;

use super::answers::AnswerStore;
use super::medicare::{valid_irn, validate_medicare};
use super::state::{AuthContext, BlockedReason};
use super::types::{FlowDefinition, StepRule};

/// Inline validation message for a step. A value, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIssue {
    /// Field the message belongs under, if any.
    pub field: Option<String>,
    pub reason: String,
}

impl StepIssue {
    fn on(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            reason: reason.into(),
        }
    }

    fn general(reason: impl Into<String>) -> Self {
        Self {
            field: None,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for StepIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.field {
            Some(ref field) => write!(f, "{field}: {}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Whether `step_id` lets the patient continue. Unknown steps fail closed.
pub fn can_continue(
    def: &FlowDefinition,
    step_id: &str,
    answers: &AnswerStore,
    auth: &AuthContext,
) -> bool {
    check_step(def, step_id, answers, auth).is_ok()
}

/// Validate one step's answers, returning the first problem found.
pub fn check_step(
    def: &FlowDefinition,
    step_id: &str,
    answers: &AnswerStore,
    auth: &AuthContext,
) -> Result<(), StepIssue> {
    let Some(step) = def.step(step_id) else {
        return Err(StepIssue::general(format!("unknown step '{step_id}'")));
    };

    match step.rule {
        StepRule::Always => Ok(()),
        StepRule::Required { ref fields } => {
            for field in fields {
                if !answers.is_present(field) {
                    return Err(StepIssue::on(field, "Please answer this question"));
                }
            }
            Ok(())
        }
        StepRule::Text { ref field, min_len } => {
            let text = answers.text(field).map(str::trim).unwrap_or_default();
            if text.is_empty() {
                return Err(StepIssue::on(field, "Please add some detail"));
            }
            if text.chars().count() < min_len {
                return Err(StepIssue::on(
                    field,
                    format!("Please add at least {min_len} characters"),
                ));
            }
            Ok(())
        }
        StepRule::Medication { ref field } => {
            match answers.get(field).and_then(|v| v.as_medication()) {
                Some(_) => Ok(()),
                None => Err(StepIssue::on(field, "Select a medication")),
            }
        }
        StepRule::Gating => {
            for q in &def.gating {
                if answers.bool(&q.field).is_none() {
                    return Err(StepIssue::on(&q.field, "Please answer this question"));
                }
            }
            if gating_blocked(def, answers) {
                return Err(StepIssue::general(
                    "This request needs a consultation with a doctor",
                ));
            }
            Ok(())
        }
        StepRule::Safety => {
            for q in &def.safety {
                if answers.bool(&q.field).is_none() {
                    return Err(StepIssue::on(&q.field, "Please answer this question"));
                }
            }
            if knocked_out(def, answers) {
                return Err(StepIssue::general(
                    "We can't safely help with this online",
                ));
            }
            Ok(())
        }
        StepRule::Medicare {
            ref number_field,
            ref irn_field,
            ref dob_field,
        } => {
            let number = answers.text(number_field).unwrap_or_default();
            validate_medicare(number).map_err(|e| StepIssue::on(number_field, e.to_string()))?;
            if !answers.text(irn_field).is_some_and(valid_irn) {
                return Err(StepIssue::on(irn_field, "Select your reference number"));
            }
            if !answers.text(dob_field).is_some_and(valid_birth_date) {
                return Err(StepIssue::on(dob_field, "Enter your date of birth"));
            }
            Ok(())
        }
        StepRule::Authenticated => {
            if auth.is_authenticated {
                Ok(())
            } else {
                Err(StepIssue::general("Create an account or sign in to continue"))
            }
        }
    }
}

/// Any gating question answered with its blocking value. Evaluated over
/// every gating answer each time, so clearing a block needs all of them to
/// pass at once.
pub fn gating_blocked(def: &FlowDefinition, answers: &AnswerStore) -> bool {
    def.gating
        .iter()
        .any(|q| answers.bool(&q.field) == Some(q.blocks_on))
}

/// Any knockout-flagged safety question answered yes.
pub fn knocked_out(def: &FlowDefinition, answers: &AnswerStore) -> bool {
    def.safety
        .iter()
        .any(|q| q.knockout && answers.bool(&q.field) == Some(true))
}

/// Knockout wins over gating when both apply.
pub fn blocked_reason(def: &FlowDefinition, answers: &AnswerStore) -> Option<BlockedReason> {
    if knocked_out(def, answers) {
        Some(BlockedReason::SafetyKnockout)
    } else if gating_blocked(def, answers) {
        Some(BlockedReason::GatingUpgradeRequired)
    } else {
        None
    }
}

fn valid_birth_date(input: &str) -> bool {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .is_ok_and(|d| d <= chrono::Utc::now().date_naive())
}
