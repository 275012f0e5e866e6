use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A medication picked from the PBS search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MedicationSelection {
    pub pbs_code: String,
    pub name: String,
    #[serde(default)]
    pub strength: Option<String>,
    #[serde(default)]
    pub form: Option<String>,
}

/// One answer field. Untagged so drafts and answer files stay plain JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AnswerValue {
    Null,
    Bool(bool),
    Text(String),
    List(Vec<String>),
    Medication(MedicationSelection),
}

impl AnswerValue {
    /// Whether the field counts as answered.
    pub fn is_present(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(_) | Self::Medication(_) => true,
            Self::Text(s) => !s.trim().is_empty(),
            Self::List(items) => !items.is_empty(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_medication(&self) -> Option<&MedicationSelection> {
        match self {
            Self::Medication(m) => Some(m),
            _ => None,
        }
    }
}

impl From<bool> for AnswerValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Option<bool>> for AnswerValue {
    fn from(b: Option<bool>) -> Self {
        b.map_or(Self::Null, Self::Bool)
    }
}

impl From<&str> for AnswerValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AnswerValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<String>> for AnswerValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

impl From<MedicationSelection> for AnswerValue {
    fn from(m: MedicationSelection) -> Self {
        Self::Medication(m)
    }
}

/// Field values for one flow instance. Holds no validation logic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnswerStore {
    values: BTreeMap<String, AnswerValue>,
}

impl AnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&AnswerValue> {
        self.values.get(field)
    }

    pub fn bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(AnswerValue::as_bool)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(AnswerValue::as_text)
    }

    pub fn is_present(&self, field: &str) -> bool {
        self.get(field).is_some_and(AnswerValue::is_present)
    }

    pub fn set(&mut self, field: &str, value: impl Into<AnswerValue>) {
        self.values.insert(field.to_string(), value.into());
    }

    pub fn all(&self) -> &BTreeMap<String, AnswerValue> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Merge typed values. Keys not in `values` keep their current value.
    pub fn merge(&mut self, values: BTreeMap<String, AnswerValue>) {
        self.values.extend(values);
    }

    /// Merge raw JSON (a draft or a transfer slot). Keys outside `known`
    /// and values of an unrecognised shape are dropped. Returns how many
    /// fields were taken.
    pub fn merge_json(
        &mut self,
        raw: &serde_json::Map<String, serde_json::Value>,
        known: &BTreeSet<&str>,
    ) -> usize {
        let mut taken = 0;
        for (key, value) in raw {
            if !known.contains(key.as_str()) {
                tracing::debug!("ignoring unknown answer field '{key}' on restore");
                continue;
            }
            match serde_json::from_value::<AnswerValue>(value.clone()) {
                Ok(v) => {
                    self.values.insert(key.clone(), v);
                    taken += 1;
                }
                Err(e) => {
                    tracing::debug!("ignoring answer field '{key}' with unexpected shape: {e}");
                }
            }
        }
        taken
    }

    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.values
            .iter()
            .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|j| (k.clone(), j)))
            .collect()
    }
}
