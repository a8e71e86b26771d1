// Template substitution engine for {{fieldName}} placeholders

use crate::errors::SubstitutionError;
use regex::{Captures, Regex};
use std::collections::HashMap;
use tracing::instrument;

/// Outcome of a substitution pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substituted {
    pub text: String,
    /// Field names that had no value and were left verbatim
    pub unresolved: Vec<String>,
}

impl Substituted {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// TemplateSubstitutor replaces `{{fieldName}}` markers with subject field values
///
/// Markers whose field is absent are kept as-is. That is degraded output, not an error.
#[derive(Debug, Clone)]
pub struct TemplateSubstitutor {
    /// Compiled regex for finding field placeholders
    placeholder_regex: Regex,
}

impl TemplateSubstitutor {
    pub fn new() -> Result<Self, SubstitutionError> {
        // Captures the field name inside {{ }}, tolerating inner whitespace
        let placeholder_regex = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
            .map_err(|e| SubstitutionError::RegexError(e.to_string()))?;

        Ok(Self { placeholder_regex })
    }

    /// Substitute every placeholder in `template` with the matching field value
    #[instrument(skip(self, fields), fields(template_len = template.len(), field_count = fields.len()))]
    pub fn substitute(&self, template: &str, fields: &HashMap<String, String>) -> Substituted {
        let mut unresolved = Vec::new();

        let text = self
            .placeholder_regex
            .replace_all(template, |caps: &Captures<'_>| {
                let name = &caps[1];
                match fields.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        if !unresolved.iter().any(|u| u == name) {
                            unresolved.push(name.to_string());
                        }
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();

        if !unresolved.is_empty() {
            tracing::debug!(
                unresolved_fields = ?unresolved,
                "Template left with unresolved placeholders"
            );
        }

        Substituted { text, unresolved }
    }

    /// Extract the unique field names referenced by a template, in order of appearance
    pub fn extract_fields(&self, template: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for cap in self.placeholder_regex.captures_iter(template) {
            let name = &cap[1];
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn has_placeholders(&self, template: &str) -> bool {
        self.placeholder_regex.is_match(template)
    }
}
