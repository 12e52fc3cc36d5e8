use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::StartupError;

/// Class names in model output order.
///
/// Loaded from a JSON object whose key order defines the index of each class.
/// The values are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabelTable {
    names: Vec<String>,
}

impl ClassLabelTable {
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let raw = fs::read_to_string(path).map_err(|source| StartupError::LabelsIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, StartupError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| StartupError::LabelsFormat(e.to_string()))?;

        let Value::Object(map) = value else {
            return Err(StartupError::LabelsFormat(
                "expected a JSON object keyed by class name".to_string(),
            ));
        };

        if map.is_empty() {
            return Err(StartupError::LabelsFormat("no classes defined".to_string()));
        }

        Ok(Self {
            names: map.into_iter().map(|(name, _)| name).collect(),
        })
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Test fixtures only. Production tables go through `from_json`, which rejects
/// an empty object.
#[cfg(test)]
impl<S: Into<String>> FromIterator<S> for ClassLabelTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}
