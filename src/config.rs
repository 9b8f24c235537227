use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// ## Structure
/// This module contains the data structures for the import plan file.
///
/// ```text
/// ImportPlan
///   └── profiles: Vec<ImportProfile>
///       ├── filename: String
///       ├── mapping: String
///       ├── source: Option<String>
///       ├── batch_size: usize
///       └── allow_update: bool
/// ```
///

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ImportPlan {
    pub profiles: Vec<ImportProfile>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImportProfile {
    pub filename: String,
    /// Name of a built-in mapping, see [`crate::mappings`].
    pub mapping: String,
    /// Source recorded against every imported row; the file name stands in
    /// when omitted.
    pub source: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_allow_update")]
    pub allow_update: bool,
}

fn default_batch_size() -> usize {
    50
}

fn default_allow_update() -> bool {
    true
}

impl ImportPlan {
    pub fn from_file(path: &Path) -> Result<ImportPlan> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read import plan {}", path.display()))?;
        let plan: ImportPlan = serde_yaml::from_str(&raw)
            .with_context(|| format!("cannot parse import plan {}", path.display()))?;
        Ok(plan)
    }
}

impl ImportProfile {
    pub fn source_name(&self) -> &str {
        match &self.source {
            Some(name) => name,
            None => &self.filename,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization() {
        let plan = ImportPlan {
            profiles: vec![ImportProfile {
                filename: "geonoma.csv".to_string(),
                mapping: "geonoma-extract".to_string(),
                source: Some("Geonoma 2024 extract".to_string()),
                batch_size: 50,
                allow_update: true,
            }],
        };

        let yaml = serde_yaml::to_string(&plan).unwrap();
        assert!(yaml.contains("profiles"));
        assert!(yaml.contains("geonoma-extract"));
    }

    #[test]
    fn test_deserialization_fills_defaults() {
        let yaml = r#"
profiles:
  - filename: "placenames.csv"
    mapping: "pilbara-placenames-csv"
"#;

        let plan: ImportPlan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(plan.profiles.len(), 1);
        assert_eq!(plan.profiles[0].batch_size, 50);
        assert!(plan.profiles[0].allow_update);
        assert_eq!(plan.profiles[0].source_name(), "placenames.csv");
    }
}
