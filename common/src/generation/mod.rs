// Generated document pipeline: generate text, render a document, store it

pub mod openai;
pub mod render;

pub use openai::OpenAiGenerator;
pub use render::{DocumentLayout, PdfDocumentRenderer};

use crate::errors::GenerationError;
use crate::models::{RenderedDocument, Subject};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Produces the body text of a generated document from subject fields
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, fields: &HashMap<String, String>) -> Result<String, GenerationError>;
}

/// Turns generated text into a document for a subject
#[cfg_attr(test, mockall::automock)]
pub trait DocumentRenderer: Send + Sync {
    fn render(&self, subject: &Subject, content: &str) -> Result<RenderedDocument, GenerationError>;
}

/// Uploads a rendered document and returns a channel-fetchable reference
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn store(
        &self,
        subject_id: Uuid,
        content_key: &str,
        document: &RenderedDocument,
    ) -> Result<String, GenerationError>;
}

/// The three external stages of a generated document, run in order
#[derive(Clone)]
pub struct GenerationPipeline {
    generator: Arc<dyn ContentGenerator>,
    renderer: Arc<dyn DocumentRenderer>,
    documents: Arc<dyn DocumentStore>,
}

impl GenerationPipeline {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        renderer: Arc<dyn DocumentRenderer>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            generator,
            renderer,
            documents,
        }
    }

    /// Generate, render and upload; returns the uploaded document reference.
    ///
    /// Nothing is cached here. A failure at any stage is returned as is.
    #[instrument(skip(self, subject), fields(subject_id = %subject.id))]
    pub async fn run(&self, subject: &Subject, content_key: &str) -> Result<String, GenerationError> {
        let content = self.generator.generate(&subject.fields).await?;
        debug!(chars = content.len(), "Content generated");

        let document = self.renderer.render(subject, &content)?;
        debug!(bytes = document.bytes.len(), "Document rendered");

        let reference = self
            .documents
            .store(subject.id, content_key, &document)
            .await?;
        debug!(reference = %reference, "Document stored");

        Ok(reference)
    }
}
