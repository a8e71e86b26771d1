// Read-only trigger -> sequence lookup

use crate::errors::CatalogError;
use crate::models::SequenceDefinition;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// SequenceCatalog maps trigger names to their immutable sequence definitions
#[derive(Debug, Clone, Default)]
pub struct SequenceCatalog {
    sequences: HashMap<String, Arc<SequenceDefinition>>,
}

impl SequenceCatalog {
    /// Build a catalog from definitions, rejecting blank or duplicate trigger names
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = SequenceDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut sequences = HashMap::new();

        for definition in definitions {
            let trigger = definition.trigger.trim().to_string();
            if trigger.is_empty() {
                return Err(CatalogError::Invalid(
                    "Sequence trigger name cannot be empty".to_string(),
                ));
            }

            let out_of_order = definition
                .steps
                .windows(2)
                .any(|pair| pair[1].delay_minutes < pair[0].delay_minutes);
            if out_of_order {
                warn!(
                    trigger = %trigger,
                    "Sequence step delays are not in increasing order; steps still run in list order"
                );
            }

            if sequences
                .insert(trigger.clone(), Arc::new(definition))
                .is_some()
            {
                return Err(CatalogError::Invalid(format!(
                    "Duplicate sequence for trigger '{}'",
                    trigger
                )));
            }
        }

        Ok(Self { sequences })
    }

    /// Parse a JSON array of sequence definitions
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let definitions: Vec<SequenceDefinition> = serde_json::from_str(json)
            .map_err(|e| CatalogError::Invalid(format!("Invalid catalog JSON: {}", e)))?;
        Self::from_definitions(definitions)
    }

    /// Load the catalog from a JSON file
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| CatalogError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let catalog = Self::from_json(&json)?;
        info!(sequences = catalog.len(), "Sequence catalog loaded");
        Ok(catalog)
    }

    pub fn get(&self, trigger: &str) -> Option<Arc<SequenceDefinition>> {
        self.sequences.get(trigger).cloned()
    }

    /// Like [`get`](Self::get) but reports an unknown trigger as an error
    pub fn require(&self, trigger: &str) -> Result<Arc<SequenceDefinition>, CatalogError> {
        self.get(trigger)
            .ok_or_else(|| CatalogError::UnknownTrigger(trigger.to_string()))
    }

    pub fn contains(&self, trigger: &str) -> bool {
        self.sequences.contains_key(trigger)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.sequences.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepDefinition, StepKind};
    use std::io::Write;

    fn text_step(delay_minutes: u32) -> StepDefinition {
        StepDefinition {
            delay_minutes,
            kind: StepKind::Text {
                template: "hola".to_string(),
            },
        }
    }

    #[test]
    fn test_lookup_by_trigger() {
        let catalog = SequenceCatalog::from_definitions(vec![SequenceDefinition {
            trigger: "bienvenida".to_string(),
            description: None,
            steps: vec![text_step(0), text_step(60)],
        }])
        .unwrap();

        assert!(catalog.contains("bienvenida"));
        assert_eq!(catalog.get("bienvenida").unwrap().len(), 2);
        assert!(catalog.get("desconocido").is_none());
        assert!(matches!(
            catalog.require("desconocido"),
            Err(CatalogError::UnknownTrigger(t)) if t == "desconocido"
        ));
    }

    #[test]
    fn test_duplicate_trigger_is_rejected() {
        let definition = SequenceDefinition {
            trigger: "bienvenida".to_string(),
            description: None,
            steps: vec![text_step(0)],
        };
        let result = SequenceCatalog::from_definitions(vec![definition.clone(), definition]);
        assert!(matches!(result, Err(CatalogError::Invalid(_))));
    }

    #[test]
    fn test_blank_trigger_is_rejected() {
        let result = SequenceCatalog::from_definitions(vec![SequenceDefinition {
            trigger: "  ".to_string(),
            description: None,
            steps: vec![],
        }]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unordered_delays_are_accepted() {
        let catalog = SequenceCatalog::from_definitions(vec![SequenceDefinition {
            trigger: "seguimiento".to_string(),
            description: None,
            steps: vec![text_step(60), text_step(0)],
        }])
        .unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"trigger": "bienvenida", "steps": [
                {{"delay_minutes": 0, "type": "text", "template": "Hola {{{{nombre}}}}"}},
                {{"delay_minutes": 60, "type": "generated_document", "content_key": "estrategia"}}
            ]}}]"#
        )
        .unwrap();

        let catalog = SequenceCatalog::load(file.path()).unwrap();
        let sequence = catalog.get("bienvenida").unwrap();
        assert_eq!(sequence.steps[1].delay_minutes, 60);
        assert_eq!(
            sequence.steps[0].kind,
            StepKind::Text {
                template: "Hola {{nombre}}".to_string()
            }
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = SequenceCatalog::load("/nonexistent/catalog.json");
        assert!(matches!(result, Err(CatalogError::LoadFailed { .. })));
    }
}
