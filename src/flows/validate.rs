use super::types::*;
use std::collections::HashSet;

/// Validation errors that prevent a flow from loading.
#[derive(Debug, Clone)]
pub struct FlowValidationError {
    pub flow_name: String,
    pub message: String,
}

impl std::fmt::Display for FlowValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow '{}': {}", self.flow_name, self.message)
    }
}

/// Build a validated `FlowDefinition` from a parsed TOML definition.
/// Returns every structural problem found, not just the first.
pub fn build_flow_definition(
    toml: &FlowDefinitionToml,
) -> Result<FlowDefinition, Vec<FlowValidationError>> {
    let mut errors = Vec::new();
    let name = &toml.flow.name;
    let mut fail = |message: String| {
        errors.push(FlowValidationError {
            flow_name: name.clone(),
            message,
        })
    };

    if toml.steps.len() < 2 {
        fail(format!(
            "flow needs at least 2 steps (found {})",
            toml.steps.len()
        ));
    }
    if toml.flow.storage_key.trim().is_empty() {
        fail("storage_key must not be empty".into());
    }

    // Check for duplicate step IDs
    let mut seen_ids = HashSet::new();
    for step in &toml.steps {
        if !seen_ids.insert(step.id.as_str()) {
            fail(format!("duplicate step id '{}'", step.id));
        }
    }

    let mut seen_stages = HashSet::new();
    for stage in &toml.stages {
        if !seen_stages.insert(stage.name.as_str()) {
            fail(format!("duplicate stage '{}'", stage.name));
        }
    }

    for (i, step) in toml.steps.iter().enumerate() {
        if !seen_stages.contains(step.stage.as_str()) {
            fail(format!(
                "step '{}': stage '{}' does not exist",
                step.id, step.stage
            ));
        }

        let boundary = i == 0 || i + 1 == toml.steps.len();
        if boundary && step.skip_when.is_some() {
            fail(format!(
                "step '{}': first and last steps cannot be skipped",
                step.id
            ));
        }

        match step.rule {
            StepRule::Required { ref fields } if fields.is_empty() => {
                fail(format!("step '{}': required rule lists no fields", step.id));
            }
            StepRule::Gating if toml.gating.is_empty() => {
                fail(format!(
                    "step '{}': gating rule but no [[gating]] questions",
                    step.id
                ));
            }
            StepRule::Safety if toml.safety.is_empty() => {
                fail(format!(
                    "step '{}': safety rule but no [[safety]] questions",
                    step.id
                ));
            }
            _ => {}
        }
    }

    // Question fields must be unique across gating and safety
    let mut seen_fields = HashSet::new();
    for field in toml
        .gating
        .iter()
        .map(|q| &q.field)
        .chain(toml.safety.iter().map(|q| &q.field))
    {
        if !seen_fields.insert(field.as_str()) {
            fail(format!("question field '{field}' is declared twice"));
        }
    }

    if let Some(ref target) = toml.flow.after_auth {
        if !seen_ids.contains(target.as_str()) {
            fail(format!("after_auth step '{target}' does not exist"));
        }
    }

    // Warnings: stages nobody uses, safety screens that can never knock out
    for stage in &toml.stages {
        if !toml.steps.iter().any(|s| s.stage == stage.name) {
            tracing::warn!("flow '{}': stage '{}' has no steps", name, stage.name);
        }
    }
    if !toml.safety.is_empty() && !toml.safety.iter().any(|q| q.knockout) {
        tracing::warn!("flow '{}': no safety question is a knockout", name);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let steps = toml
        .steps
        .iter()
        .map(|s| Step {
            id: s.id.clone(),
            stage: s.stage.clone(),
            rule: s.rule.clone(),
            skip_when: s.skip_when,
        })
        .collect();

    Ok(FlowDefinition {
        name: toml.flow.name.clone(),
        variant: toml.flow.variant,
        description: toml.flow.description.clone(),
        storage_key: toml.flow.storage_key.clone(),
        after_auth: toml.flow.after_auth.clone(),
        upgrade_path: toml.flow.upgrade_path.clone(),
        knockout_resource: toml.flow.knockout_resource.clone(),
        stages: toml.stages.clone(),
        steps,
        gating: toml.gating.clone(),
        safety: toml.safety.clone(),
        submission: toml.submission.clone(),
    })
}
