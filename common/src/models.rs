use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Sequence Models
// ============================================================================

/// SequenceDefinition is the ordered list of steps a trigger enrolls a subject into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl SequenceDefinition {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// StepDefinition is one timed message within a sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Offset from enrollment start at which the step becomes due
    pub delay_minutes: u32,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// StepKind defines what a step sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Text {
        template: String,
    },
    Audio {
        /// Resolves to a channel-fetchable URL
        template: String,
    },
    Image {
        /// Resolves to a channel-fetchable URL
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    GeneratedDocument {
        /// Logical cache key; defaults to `{trigger}:{step_index}`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Text { .. } => "text",
            StepKind::Audio { .. } => "audio",
            StepKind::Image { .. } => "image",
            StepKind::GeneratedDocument { .. } => "generated_document",
        }
    }
}

// ============================================================================
// Subject Models
// ============================================================================

/// Subject is an enrolled entity, e.g. a lead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: Uuid,
    /// Normalized channel address (e.g. a WhatsApp phone number)
    pub channel_address: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub enrollments: Vec<Enrollment>,
    /// Cached generated artifact references keyed by logical content key
    #[serde(default)]
    pub generated_artifacts: HashMap<String, String>,
}

impl Subject {
    pub fn new(channel_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_address: channel_address.into(),
            fields: HashMap::new(),
            enrollments: Vec::new(),
            generated_artifacts: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn enrollment(&self, trigger: &str) -> Option<&Enrollment> {
        self.enrollments.iter().find(|e| e.trigger == trigger)
    }
}

/// Enrollment is a subject's live progress through one sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub next_step_index: u32,
}

impl Enrollment {
    pub fn new(trigger: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            trigger: trigger.into(),
            started_at,
            next_step_index: 0,
        }
    }
}

/// Identifies one enrollment: a subject in a trigger's sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnrollmentKey {
    pub subject_id: Uuid,
    pub trigger: String,
}

impl EnrollmentKey {
    pub fn new(subject_id: Uuid, trigger: impl Into<String>) -> Self {
        Self {
            subject_id,
            trigger: trigger.into(),
        }
    }

    /// Resource name used for per-enrollment locking
    pub fn lock_resource(&self) -> String {
        format!("enrollment:{}:{}", self.subject_id, self.trigger)
    }
}

impl fmt::Display for EnrollmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.trigger)
    }
}

/// GeneratedArtifact is a cached result of the expensive generation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub subject_id: Uuid,
    pub content_key: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Result of an atomic compare-and-advance on an enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced,
    /// The stored index no longer matched; another process advanced it
    Conflict,
}

// ============================================================================
// Dispatch Models
// ============================================================================

/// ResolvedContent is a dispatch-ready message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedContent {
    Text {
        body: String,
    },
    Audio {
        url: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Document {
        url: String,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl ResolvedContent {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolvedContent::Text { .. } => "text",
            ResolvedContent::Audio { .. } => "audio",
            ResolvedContent::Image { .. } => "image",
            ResolvedContent::Document { .. } => "document",
        }
    }
}

/// Document produced by a renderer, ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub extension: String,
}
