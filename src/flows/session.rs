use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::answers::AnswerValue;
use super::db::KeyValueStore;
use super::draft::{DraftAdapter, DraftSnapshot, DEFAULT_MAX_AGE_HOURS, DEFAULT_TRANSFER_KEY};
use super::sequencer;
use super::state::{AuthContext, BlockedReason, FlowError, FlowInstance, Navigation};
use super::submit::{self, CheckoutClient, SubmitError};
use super::types::FlowDefinition;
use crate::observability;

/// Draft timing and storage keys for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub debounce: Duration,
    pub max_age: chrono::Duration,
    pub transfer_key: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            max_age: chrono::Duration::hours(DEFAULT_MAX_AGE_HOURS),
            transfer_key: DEFAULT_TRANSFER_KEY.to_string(),
        }
    }
}

/// What happened when the flow was mounted.
#[derive(Debug, Clone, PartialEq)]
pub enum MountOutcome {
    Fresh,
    /// Answers came back from an external auth redirect.
    TransferRestored { fields: usize },
    /// A recent draft exists; the patient must choose before any step shows.
    RecoveryOffered(RecoveryOffer),
    AlreadyMounted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOffer {
    pub current_step: String,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    Continue,
    StartFresh,
}

/// One patient's pass through a flow: the instance plus draft mirroring
/// and checkout handoff. Must be driven from inside a Tokio runtime.
pub struct FlowSession {
    instance: FlowInstance,
    drafts: Arc<DraftAdapter>,
    debounce: Duration,
    pending_write: Option<JoinHandle<()>>,
    pending_recovery: Option<DraftSnapshot>,
    mounted: bool,
    submitting: bool,
    last_error: Option<String>,
}

impl FlowSession {
    pub fn new(
        definition: Arc<FlowDefinition>,
        store: Arc<dyn KeyValueStore>,
        options: SessionOptions,
    ) -> Self {
        let drafts = Arc::new(DraftAdapter::new(
            store,
            &definition.storage_key,
            &options.transfer_key,
            options.max_age,
        ));
        Self {
            instance: FlowInstance::new(definition),
            drafts,
            debounce: options.debounce,
            pending_write: None,
            pending_recovery: None,
            mounted: false,
            submitting: false,
            last_error: None,
        }
    }

    pub fn instance(&self) -> &FlowInstance {
        &self.instance
    }

    pub fn drafts(&self) -> &DraftAdapter {
        &self.drafts
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn recovery_pending(&self) -> bool {
        self.pending_recovery.is_some()
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending_write
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn mount(&mut self) -> MountOutcome {
        self.mount_at(Utc::now())
    }

    /// Runs once per session. Consumes the post-auth transfer slot first;
    /// a consumed transfer replaces the draft recovery offer.
    pub fn mount_at(&mut self, now: DateTime<Utc>) -> MountOutcome {
        if self.mounted {
            return MountOutcome::AlreadyMounted;
        }
        self.mounted = true;

        if let Some(transfer) = self.drafts.take_transfer() {
            let fields = self.instance.restore_json(&transfer);
            self.drafts.observe_stored();
            tracing::info!(
                "flow '{}': restored {fields} answers after auth redirect",
                self.instance.definition().name
            );
            return MountOutcome::TransferRestored { fields };
        }

        let first = self.instance.definition().first_step().to_string();
        match self.drafts.load_recoverable(&first, now) {
            Some(snapshot) => {
                let offer = RecoveryOffer {
                    current_step: snapshot.data.current_step.clone(),
                    saved_at: snapshot.timestamp,
                };
                self.pending_recovery = Some(snapshot);
                MountOutcome::RecoveryOffered(offer)
            }
            None => MountOutcome::Fresh,
        }
    }

    /// Apply the patient's answer to the recovery offer. A continued draft
    /// never lands on a step the current auth state skips.
    pub fn resolve_recovery(
        &mut self,
        choice: RecoveryChoice,
        auth: &AuthContext,
    ) -> Result<Navigation, FlowError> {
        let Some(snapshot) = self.pending_recovery.take() else {
            return Ok(Navigation::Stayed);
        };
        match choice {
            RecoveryChoice::Continue => {
                self.instance.restore_json(&snapshot.data.answers);
                let from = self.instance.current_step().to_string();
                let target = snapshot.data.current_step;
                match self.instance.jump_to(&target) {
                    Ok(_) => {}
                    Err(FlowError::StepNotFound(step)) => {
                        tracing::debug!("draft step '{step}' no longer exists, staying on first step");
                    }
                    Err(e) => return Err(e),
                }
                self.instance.leave_skipped_step(auth);
                let to = self.instance.current_step();
                if to == from {
                    Ok(Navigation::Stayed)
                } else {
                    Ok(Navigation::Moved {
                        from,
                        to: to.to_string(),
                    })
                }
            }
            RecoveryChoice::StartFresh => {
                self.drafts.discard();
                self.instance.reset();
                Ok(Navigation::Stayed)
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), FlowError> {
        if !self.mounted {
            return Err(FlowError::NotMounted);
        }
        if self.pending_recovery.is_some() {
            return Err(FlowError::RecoveryPending);
        }
        Ok(())
    }

    pub fn set_answer(
        &mut self,
        field: &str,
        value: impl Into<AnswerValue>,
    ) -> Result<Option<BlockedReason>, FlowError> {
        self.ensure_ready()?;
        let blocked = self.instance.set_answer(field, value);
        self.schedule_draft_write();
        Ok(blocked)
    }

    pub fn can_continue(&self, auth: &AuthContext) -> bool {
        self.mounted && self.pending_recovery.is_none() && self.instance.can_continue(auth)
    }

    pub fn next(&mut self, auth: &AuthContext) -> Result<Navigation, FlowError> {
        self.ensure_ready()?;
        let nav = self.instance.next(auth)?;
        if matches!(nav, Navigation::Moved { .. }) {
            self.schedule_draft_write();
        }
        Ok(nav)
    }

    pub fn back(&mut self, auth: &AuthContext) -> Result<Navigation, FlowError> {
        self.ensure_ready()?;
        let nav = self.instance.back(auth);
        if matches!(nav, Navigation::Moved { .. }) {
            self.schedule_draft_write();
        }
        Ok(nav)
    }

    /// Callback from the embedded auth step.
    pub fn complete_auth(&mut self, subject_id: &str, profile_id: &str) -> Result<Navigation, FlowError> {
        self.ensure_ready()?;
        let nav = self.instance.complete_auth(subject_id, profile_id)?;
        self.schedule_draft_write();
        Ok(nav)
    }

    /// Park the answers before leaving for an external auth page.
    pub fn stash_for_auth_redirect(&self) -> bool {
        self.drafts.stash_transfer(self.instance.answers())
    }

    /// (Re)start the debounce timer. Nothing is mirrored on the first or
    /// last step.
    fn schedule_draft_write(&mut self) {
        if let Some(handle) = self.pending_write.take() {
            handle.abort();
        }
        if self.instance.is_at_first_step() || self.instance.is_at_last_step() {
            return;
        }
        let drafts = Arc::clone(&self.drafts);
        let answers = self.instance.answers().clone();
        let step = self.instance.current_step().to_string();
        let delay = self.debounce;
        self.pending_write = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drafts.write(&answers, &step, Utc::now());
        }));
    }

    /// Hand the answers to the checkout collaborator with a fresh
    /// idempotency key. No retry: on failure the patient stays here and
    /// may submit again.
    pub async fn submit(
        &mut self,
        auth: &AuthContext,
        client: &dyn CheckoutClient,
    ) -> Result<String, SubmitError> {
        if self.pending_recovery.is_some() {
            return Err(SubmitError::RecoveryPending);
        }
        let def = self.instance.definition();
        if !self.instance.is_at_last_step() {
            return Err(SubmitError::NotAtPaymentStep(def.last_step().to_string()));
        }
        if let Some(reason) = self.instance.blocked_reason() {
            return Err(SubmitError::Blocked(reason));
        }
        if let Some(step) =
            sequencer::first_unsatisfied_step(def, self.instance.answers(), auth, def.last_step())
        {
            return Err(SubmitError::Incomplete(step.to_string()));
        }

        let request = submit::build_request(
            def,
            self.instance.answers(),
            submit::new_idempotency_key(),
        );
        let flow_name = def.name.clone();

        self.submitting = true;
        self.last_error = None;
        let result = match client.create_checkout(&request).await {
            Ok(resp) => submit::interpret(resp),
            Err(e) => Err(SubmitError::Transport(format!("{e:#}"))),
        };
        self.submitting = false;

        match result {
            Ok(url) => {
                tracing::info!("flow '{flow_name}': checkout created, redirecting");
                observability::metrics()
                    .submissions
                    .with_label_values(&[&flow_name, "success"])
                    .inc();
                if let Some(handle) = self.pending_write.take() {
                    handle.abort();
                }
                self.drafts.discard();
                Ok(url)
            }
            Err(e) => {
                tracing::warn!("flow '{flow_name}': checkout failed: {e}");
                observability::metrics()
                    .submissions
                    .with_label_values(&[&flow_name, "error"])
                    .inc();
                self.last_error = Some(e.user_message());
                Err(e)
            }
        }
    }

    /// Cancel any pending draft write.
    pub fn teardown(&mut self) {
        if let Some(handle) = self.pending_write.take() {
            handle.abort();
        }
    }
}

impl Drop for FlowSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
