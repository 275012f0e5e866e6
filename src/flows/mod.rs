pub mod answers;
pub mod db;
pub mod draft;
pub mod gating;
pub mod medicare;
pub mod sequencer;
pub mod session;
pub mod state;
pub mod submit;
pub mod types;
pub mod validate;

use std::collections::HashMap;
use std::path::Path;
use types::FlowDefinition;

const BUILTIN_FLOWS: &[(&str, &str)] = &[
    (
        "prescription.toml",
        include_str!("../../flows/prescription.toml"),
    ),
    (
        "medical_certificate.toml",
        include_str!("../../flows/medical_certificate.toml"),
    ),
];

/// The two intake flows shipped with the binary, keyed by flow name.
pub fn builtin_flows() -> anyhow::Result<HashMap<String, FlowDefinition>> {
    let mut definitions = HashMap::new();
    let mut all_errors = Vec::new();
    for (file, content) in BUILTIN_FLOWS {
        parse_into(&mut definitions, &mut all_errors, content, file)?;
    }
    finish(definitions, all_errors)
}

/// Load and validate all flow TOML files from the given directory.
/// Returns a map of flow_name -> FlowDefinition.
///
/// If the directory does not exist, returns an empty map (not an error).
/// If any flow file fails to parse or validate, returns an error.
pub fn load_flows(flows_dir: &Path) -> anyhow::Result<HashMap<String, FlowDefinition>> {
    if !flows_dir.exists() {
        tracing::debug!("flows directory does not exist: {}", flows_dir.display());
        return Ok(HashMap::new());
    }

    let mut definitions = HashMap::new();
    let mut all_errors = Vec::new();

    let entries = std::fs::read_dir(flows_dir)
        .map_err(|e| anyhow::anyhow!("failed to read flows directory: {e}"))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

        parse_into(
            &mut definitions,
            &mut all_errors,
            &content,
            &path.display().to_string(),
        )?;
    }

    finish(definitions, all_errors)
}

/// Built-in flows overlaid with any operator flows from `flows_dir`.
/// An operator file with the same flow name replaces the built-in one.
pub fn load_all(flows_dir: Option<&Path>) -> anyhow::Result<HashMap<String, FlowDefinition>> {
    let mut definitions = builtin_flows()?;
    if let Some(dir) = flows_dir {
        for (name, def) in load_flows(dir)? {
            if definitions.contains_key(&name) {
                tracing::info!("flow '{}' overridden from {}", name, dir.display());
            }
            definitions.insert(name, def);
        }
    }
    Ok(definitions)
}

fn parse_into(
    definitions: &mut HashMap<String, FlowDefinition>,
    all_errors: &mut Vec<String>,
    content: &str,
    source: &str,
) -> anyhow::Result<()> {
    let toml_def: types::FlowDefinitionToml = toml::from_str(content)
        .map_err(|e| anyhow::anyhow!("failed to parse {source}: {e}"))?;

    match validate::build_flow_definition(&toml_def) {
        Ok(def) => {
            if definitions.contains_key(&def.name) {
                all_errors.push(format!("duplicate flow name '{}' in {source}", def.name));
            } else {
                tracing::debug!("loaded flow '{}' from {source}", def.name);
                definitions.insert(def.name.clone(), def);
            }
        }
        Err(errors) => {
            for e in errors {
                all_errors.push(format!("{e} ({source})"));
            }
        }
    }
    Ok(())
}

fn finish(
    definitions: HashMap<String, FlowDefinition>,
    all_errors: Vec<String>,
) -> anyhow::Result<HashMap<String, FlowDefinition>> {
    if !all_errors.is_empty() {
        anyhow::bail!("flow validation errors:\n  {}", all_errors.join("\n  "));
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[flow]
name = "same"
variant = "medical-certificate"
storage_key = "same_draft"

[[stages]]
name = "Details"
minutes = 1

[[steps]]
id = "s1"
stage = "Details"
rule = { kind = "required", fields = ["a"] }

[[steps]]
id = "s2"
stage = "Details"
rule = { kind = "always" }

[submission]
category = "c"
subtype = "s"
type = "t"
"#;

    #[test]
    fn builtin_flows_load() {
        let flows = builtin_flows().unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows["prescription"].storage_key, "instantmed_rx_draft");
        assert_eq!(flows["medical_certificate"].storage_key, "instantmed_cert_draft");
        assert_eq!(flows["prescription"].first_step(), "type");
        assert_eq!(flows["prescription"].last_step(), "payment");
    }

    #[test]
    fn load_flows_missing_dir_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let flows_dir = tmp.path().join("nonexistent_flows");
        let result = load_flows(&flows_dir).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn load_flows_valid_file() {
        let tmp = TempDir::new().unwrap();
        let flows_dir = tmp.path().join("flows");
        std::fs::create_dir(&flows_dir).unwrap();
        std::fs::write(flows_dir.join("same.toml"), MINIMAL).unwrap();
        std::fs::write(flows_dir.join("notes.txt"), "ignored").unwrap();

        let result = load_flows(&flows_dir).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("same"));
    }

    #[test]
    fn load_flows_invalid_file_errors() {
        let tmp = TempDir::new().unwrap();
        let flows_dir = tmp.path().join("flows");
        std::fs::create_dir(&flows_dir).unwrap();
        std::fs::write(
            flows_dir.join("bad.toml"),
            MINIMAL.replace("stage = \"Details\"\nrule = { kind = \"always\" }", "stage = \"Nowhere\"\nrule = { kind = \"always\" }"),
        )
        .unwrap();

        let err = load_flows(&flows_dir).unwrap_err().to_string();
        assert!(err.contains("stage 'Nowhere'"));
    }

    #[test]
    fn load_flows_duplicate_name_errors() {
        let tmp = TempDir::new().unwrap();
        let flows_dir = tmp.path().join("flows");
        std::fs::create_dir(&flows_dir).unwrap();
        std::fs::write(flows_dir.join("a.toml"), MINIMAL).unwrap();
        std::fs::write(flows_dir.join("b.toml"), MINIMAL).unwrap();

        let result = load_flows(&flows_dir);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("duplicate flow name"));
    }

    #[test]
    fn operator_flow_overrides_builtin() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("rx.toml"),
            MINIMAL.replace("name = \"same\"", "name = \"prescription\""),
        )
        .unwrap();

        let flows = load_all(Some(tmp.path())).unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows["prescription"].first_step(), "s1");
    }
}
