// Trigger firing: enroll a subject into the sequence of a trigger

use crate::errors::{EnrollmentError, ValidationError};
use crate::models::Subject;
use crate::sequence::SequenceCatalog;
use crate::store::EnrollmentStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

/// Entry point used by intake code to start a subject on a sequence
pub struct TriggerService {
    catalog: Arc<SequenceCatalog>,
    store: Arc<dyn EnrollmentStore>,
}

impl TriggerService {
    pub fn new(catalog: Arc<SequenceCatalog>, store: Arc<dyn EnrollmentStore>) -> Self {
        Self { catalog, store }
    }

    /// Enroll `subject` in `trigger` starting at `now`.
    ///
    /// The subject's address and fields are saved first. Returns `false` when the subject
    /// was already enrolled in that trigger; existing progress is not reset.
    #[instrument(skip(self, subject), fields(subject_id = %subject.id))]
    pub async fn fire(
        &self,
        subject: &Subject,
        trigger: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EnrollmentError> {
        self.catalog.require(trigger)?;

        if subject.channel_address.trim().is_empty() {
            return Err(ValidationError::MissingField("channel_address".to_string()).into());
        }

        self.store.upsert_subject(subject).await?;
        let enrolled = self.store.enroll(subject.id, trigger, now).await?;

        if enrolled {
            info!(trigger = %trigger, "Subject enrolled");
        } else {
            info!(trigger = %trigger, "Subject already enrolled, progress kept");
        }
        Ok(enrolled)
    }
}
