use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::state::AuthContext;

// ── TOML-parsed types ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FlowDefinitionToml {
    pub flow: FlowMeta,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub steps: Vec<StepToml>,
    #[serde(default)]
    pub gating: Vec<GatingQuestion>,
    #[serde(default)]
    pub safety: Vec<SafetyQuestion>,
    pub submission: Submission,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowMeta {
    pub name: String,
    pub variant: FlowVariant,
    #[serde(default)]
    pub description: Option<String>,
    /// Local storage key holding this flow's draft.
    pub storage_key: String,
    /// Step the embedded auth callback lands on.
    #[serde(default)]
    pub after_auth: Option<String>,
    /// Where a gating block sends the patient instead.
    #[serde(default)]
    pub upgrade_path: Option<String>,
    /// External resource shown on the knockout screen.
    #[serde(default)]
    pub knockout_resource: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepToml {
    pub id: String,
    pub stage: String,
    pub rule: StepRule,
    #[serde(default)]
    pub skip_when: Option<SkipCondition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FlowVariant {
    PrescriptionRepeat,
    MedicalCertificate,
}

impl std::fmt::Display for FlowVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrescriptionRepeat => write!(f, "prescription-repeat"),
            Self::MedicalCertificate => write!(f, "medical-certificate"),
        }
    }
}

/// Progress grouping shown above the form, with a display-only estimate.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub minutes: u32,
}

/// What a step needs before the patient may continue.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepRule {
    Always,
    Required {
        fields: Vec<String>,
    },
    Text {
        field: String,
        #[serde(default)]
        min_len: usize,
    },
    Medication {
        field: String,
    },
    Gating,
    Safety,
    Medicare {
        #[serde(default = "default_medicare_number_field")]
        number_field: String,
        #[serde(default = "default_medicare_irn_field")]
        irn_field: String,
        #[serde(default = "default_dob_field")]
        dob_field: String,
    },
    Authenticated,
}

fn default_medicare_number_field() -> String {
    "medicare_number".into()
}

fn default_medicare_irn_field() -> String {
    "medicare_irn".into()
}

fn default_dob_field() -> String {
    "date_of_birth".into()
}

impl StepRule {
    /// Answer fields this rule reads directly.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Required { fields } => fields.iter().map(String::as_str).collect(),
            Self::Text { field, .. } | Self::Medication { field } => vec![field.as_str()],
            Self::Medicare {
                number_field,
                irn_field,
                dob_field,
            } => vec![number_field.as_str(), irn_field.as_str(), dob_field.as_str()],
            Self::Always | Self::Gating | Self::Safety | Self::Authenticated => Vec::new(),
        }
    }
}

/// Auth-derived predicate under which a step is skipped in both directions.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipCondition {
    /// Signed in with a stored profile (no onboarding pending).
    ProfileComplete,
    Authenticated,
}

impl SkipCondition {
    pub fn holds(self, auth: &AuthContext) -> bool {
        match self {
            Self::ProfileComplete => auth.has_profile(),
            Self::Authenticated => auth.is_authenticated,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GatingQuestion {
    pub field: String,
    /// The answer that blocks the flow.
    pub blocks_on: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SafetyQuestion {
    pub field: String,
    #[serde(default)]
    pub knockout: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub category: String,
    pub subtype: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Answer whose text overrides `subtype` when present.
    #[serde(default)]
    pub subtype_field: Option<String>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

// ── Validated runtime types ─────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub name: String,
    pub variant: FlowVariant,
    pub description: Option<String>,
    pub storage_key: String,
    pub after_auth: Option<String>,
    pub upgrade_path: Option<String>,
    pub knockout_resource: Option<String>,
    pub stages: Vec<Stage>,
    pub steps: Vec<Step>,
    pub gating: Vec<GatingQuestion>,
    pub safety: Vec<SafetyQuestion>,
    pub submission: Submission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub stage: String,
    pub rule: StepRule,
    pub skip_when: Option<SkipCondition>,
}

impl Step {
    pub fn is_skipped(&self, auth: &AuthContext) -> bool {
        self.skip_when.is_some_and(|c| c.holds(auth))
    }
}

/// Where a step sits in the progress bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress<'a> {
    pub stage: &'a str,
    pub stage_index: usize,
    pub stage_count: usize,
    /// Estimate for this stage and every later one.
    pub minutes_remaining: u32,
}

impl FlowDefinition {
    pub fn first_step(&self) -> &str {
        &self.steps[0].id
    }

    pub fn last_step(&self) -> &str {
        &self.steps[self.steps.len() - 1].id
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_first(&self, step_id: &str) -> bool {
        self.first_step() == step_id
    }

    pub fn is_last(&self, step_id: &str) -> bool {
        self.last_step() == step_id
    }

    /// Every answer field the definition knows about.
    pub fn known_fields(&self) -> BTreeSet<&str> {
        let mut fields: BTreeSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.rule.fields())
            .collect();
        fields.extend(self.gating.iter().map(|q| q.field.as_str()));
        fields.extend(self.safety.iter().map(|q| q.field.as_str()));
        if let Some(ref f) = self.submission.subtype_field {
            fields.insert(f.as_str());
        }
        fields
    }

    pub fn progress(&self, step_id: &str) -> Option<Progress<'_>> {
        let step = self.step(step_id)?;
        let stage_index = self.stages.iter().position(|s| s.name == step.stage)?;
        let minutes_remaining = self.stages[stage_index..].iter().map(|s| s.minutes).sum();
        Some(Progress {
            stage: &self.stages[stage_index].name,
            stage_index,
            stage_count: self.stages.len(),
            minutes_remaining,
        })
    }
}
