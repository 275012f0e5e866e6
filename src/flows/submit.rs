use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::answers::{AnswerStore, AnswerValue};
use super::state::BlockedReason;
use super::types::FlowDefinition;

/// Body sent to the checkout collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub category: String,
    pub subtype: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub answers: serde_json::Map<String, serde_json::Value>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub success: bool,
    #[serde(default)]
    pub checkout_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Creates the intake record and a payment session, returning where to send
/// the patient.
#[async_trait]
pub trait CheckoutClient: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> anyhow::Result<CheckoutResponse>;
}

/// Error from a submit attempt. The patient stays on the payment step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("submission is only possible from the '{0}' step")]
    NotAtPaymentStep(String),
    #[error("flow is blocked: {0}")]
    Blocked(BlockedReason),
    #[error("step '{0}' still needs answers")]
    Incomplete(String),
    #[error("a saved draft is waiting to be continued or discarded")]
    RecoveryPending,
    #[error("{0}")]
    Rejected(String),
    #[error("no checkout URL received")]
    MissingCheckoutUrl,
    #[error("checkout request failed: {0}")]
    Transport(String),
}

impl SubmitError {
    /// Message for the single error line on the payment step.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected(msg) => msg.clone(),
            Self::Transport(_) => "Something went wrong starting checkout. Please try again.".into(),
            other => other.to_string(),
        }
    }
}

/// Reqwest-backed collaborator posting JSON to a checkout endpoint.
pub struct HttpCheckoutClient {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpCheckoutClient {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CheckoutClient for HttpCheckoutClient {
    async fn create_checkout(&self, request: &CheckoutRequest) -> anyhow::Result<CheckoutResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        match serde_json::from_str::<CheckoutResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => {
                anyhow::bail!("checkout endpoint returned {status}")
            }
            Err(e) => Err(anyhow::anyhow!("unreadable checkout response: {e}")),
        }
    }
}

pub fn new_idempotency_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Flatten answers into the collaborator's field names. Medication
/// selections become `pbs_code`/`medication_name`/`strength`/`form`; other
/// fields go through the flow's rename table. Unanswered fields are dropped.
pub fn normalize_answers(
    def: &FlowDefinition,
    answers: &AnswerStore,
) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    for (field, value) in answers.all() {
        match value {
            AnswerValue::Null => {}
            AnswerValue::Medication(m) => {
                out.insert("pbs_code".into(), m.pbs_code.clone().into());
                out.insert("medication_name".into(), m.name.clone().into());
                if let Some(ref strength) = m.strength {
                    out.insert("strength".into(), strength.clone().into());
                }
                if let Some(ref form) = m.form {
                    out.insert("form".into(), form.clone().into());
                }
            }
            other => {
                let name = def
                    .submission
                    .rename
                    .get(field)
                    .cloned()
                    .unwrap_or_else(|| field.clone());
                if let Ok(v) = serde_json::to_value(other) {
                    out.insert(name, v);
                }
            }
        }
    }
    out
}

/// Subtype from the configured answer field, falling back to the static one.
pub fn resolve_subtype(def: &FlowDefinition, answers: &AnswerStore) -> String {
    def.submission
        .subtype_field
        .as_deref()
        .and_then(|f| answers.text(f))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(def.submission.subtype.as_str())
        .to_string()
}

pub fn build_request(
    def: &FlowDefinition,
    answers: &AnswerStore,
    idempotency_key: String,
) -> CheckoutRequest {
    CheckoutRequest {
        category: def.submission.category.clone(),
        subtype: resolve_subtype(def, answers),
        kind: def.submission.kind.clone(),
        answers: normalize_answers(def, answers),
        idempotency_key,
    }
}

/// Map a collaborator response to the redirect target.
pub fn interpret(resp: CheckoutResponse) -> Result<String, SubmitError> {
    if !resp.success {
        return Err(SubmitError::Rejected(
            resp.error
                .unwrap_or_else(|| "Checkout could not be started".into()),
        ));
    }
    match resp.checkout_url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(SubmitError::MissingCheckoutUrl),
    }
}
