// Content resolution: turn a step definition into dispatch-ready content

use crate::errors::{GenerationError, SubstitutionError};
use crate::generation::GenerationPipeline;
use crate::models::{ResolvedContent, StepDefinition, StepKind, Subject};
use crate::store::EnrollmentStore;
use crate::substitution::TemplateSubstitutor;
use crate::telemetry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

type FlightKey = (Uuid, String);

/// Resolves step content for a subject
///
/// Template steps are filled from subject fields. Generated documents are cached per
/// (subject, content key): a snapshot hit returns immediately, and concurrent misses
/// for the same key in this process share a single generation.
pub struct ContentResolver {
    substitutor: TemplateSubstitutor,
    pipeline: GenerationPipeline,
    store: Arc<dyn EnrollmentStore>,
    in_flight: Mutex<HashMap<FlightKey, Arc<OnceCell<String>>>>,
}

impl ContentResolver {
    pub fn new(
        pipeline: GenerationPipeline,
        store: Arc<dyn EnrollmentStore>,
    ) -> Result<Self, SubstitutionError> {
        Ok(Self {
            substitutor: TemplateSubstitutor::new()?,
            pipeline,
            store,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    #[instrument(skip(self, subject, step), fields(subject_id = %subject.id, kind = step.kind.name()))]
    pub async fn resolve(
        &self,
        subject: &Subject,
        trigger: &str,
        step_index: usize,
        step: &StepDefinition,
    ) -> Result<ResolvedContent, GenerationError> {
        match &step.kind {
            StepKind::Text { template } => Ok(ResolvedContent::Text {
                body: self.fill(subject, template),
            }),
            StepKind::Audio { template } => Ok(ResolvedContent::Audio {
                url: self.fill(subject, template),
            }),
            StepKind::Image { template, caption } => Ok(ResolvedContent::Image {
                url: self.fill(subject, template),
                caption: caption.as_deref().map(|c| self.fill(subject, c)),
            }),
            StepKind::GeneratedDocument {
                content_key,
                file_name,
                caption,
            } => {
                let key = content_key
                    .clone()
                    .unwrap_or_else(|| default_content_key(trigger, step_index));
                let url = self.generated_reference(subject, &key).await?;
                let file_name = file_name
                    .clone()
                    .unwrap_or_else(|| default_file_name(&url));

                Ok(ResolvedContent::Document {
                    url,
                    file_name,
                    caption: caption.as_deref().map(|c| self.fill(subject, c)),
                })
            }
        }
    }

    fn fill(&self, subject: &Subject, template: &str) -> String {
        let result = self.substitutor.substitute(template, &subject.fields);
        if !result.is_complete() {
            warn!(
                subject_id = %subject.id,
                unresolved = ?result.unresolved,
                "Template has fields the subject does not define"
            );
        }
        result.text
    }

    /// Reference of the generated artifact for `key`, generating it at most once
    async fn generated_reference(
        &self,
        subject: &Subject,
        key: &str,
    ) -> Result<String, GenerationError> {
        if let Some(reference) = subject.generated_artifacts.get(key) {
            debug!(content_key = %key, "Generated artifact found in snapshot");
            return Ok(reference.clone());
        }

        let flight_key = (subject.id, key.to_string());
        let cell = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(flight_key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| self.generate_and_persist(subject, key))
            .await
            .cloned();

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight
                .get(&flight_key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                in_flight.remove(&flight_key);
            }
        }

        result
    }

    async fn generate_and_persist(
        &self,
        subject: &Subject,
        key: &str,
    ) -> Result<String, GenerationError> {
        // Another process may have generated it after our snapshot was taken
        if let Some(existing) = self.store.find_artifact(subject.id, key).await? {
            debug!(content_key = %key, "Generated artifact found in store");
            return Ok(existing);
        }

        let reference = self.pipeline.run(subject, key).await?;
        let stored = self.store.save_artifact(subject.id, key, &reference).await?;
        telemetry::record_generation();

        if stored != reference {
            info!(content_key = %key, "Concurrent generation won; using stored artifact");
        } else {
            info!(content_key = %key, "Generated artifact persisted");
        }
        Ok(stored)
    }
}

/// Cache key used when a generated step does not name one
pub fn default_content_key(trigger: &str, step_index: usize) -> String {
    format!("{}:{}", trigger, step_index)
}

fn default_file_name(reference: &str) -> String {
    let extension = reference
        .rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .unwrap_or("pdf");
    format!("documento.{}", extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{ContentGenerator, DocumentStore, PdfDocumentRenderer};
    use crate::models::RenderedDocument;
    use crate::store::InMemoryEnrollmentStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ContentGenerator for CountingGenerator {
        async fn generate(
            &self,
            _fields: &HashMap<String, String>,
        ) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(GenerationError::Generation("quota exceeded".to_string()));
            }
            Ok("Plan mensual".to_string())
        }
    }

    struct FakeDocuments;

    #[async_trait]
    impl DocumentStore for FakeDocuments {
        async fn store(
            &self,
            subject_id: Uuid,
            content_key: &str,
            document: &RenderedDocument,
        ) -> Result<String, GenerationError> {
            Ok(format!(
                "https://files/{}/{}.{}",
                subject_id, content_key, document.extension
            ))
        }
    }

    async fn setup(fail: bool) -> (Arc<ContentResolver>, Arc<CountingGenerator>, Arc<InMemoryEnrollmentStore>, Subject) {
        let generator = Arc::new(CountingGenerator {
            calls: AtomicUsize::new(0),
            fail,
        });
        let store = Arc::new(InMemoryEnrollmentStore::new());
        let subject = Subject::new("5215512345678")
            .with_field("nombre", "Ana")
            .with_field("giro", "panaderia");
        store.upsert_subject(&subject).await.unwrap();

        let pipeline = GenerationPipeline::new(
            generator.clone(),
            Arc::new(PdfDocumentRenderer::default()),
            Arc::new(FakeDocuments),
        );
        let resolver = Arc::new(ContentResolver::new(pipeline, store.clone()).unwrap());
        (resolver, generator, store, subject)
    }

    fn document_step() -> StepDefinition {
        StepDefinition {
            delay_minutes: 0,
            kind: StepKind::GeneratedDocument {
                content_key: Some("estrategia".to_string()),
                file_name: None,
                caption: Some("Tu estrategia, {{nombre}}".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn test_text_template_is_filled() {
        let (resolver, _, _, subject) = setup(false).await;
        let step = StepDefinition {
            delay_minutes: 0,
            kind: StepKind::Text {
                template: "Hola {{nombre}}".to_string(),
            },
        };

        let content = resolver.resolve(&subject, "bienvenida", 0, &step).await.unwrap();
        assert_eq!(
            content,
            ResolvedContent::Text {
                body: "Hola Ana".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unresolved_marker_is_left_verbatim() {
        let (resolver, _, _, subject) = setup(false).await;
        let step = StepDefinition {
            delay_minutes: 0,
            kind: StepKind::Image {
                template: "https://cdn/{{giro}}/{{logo}}.png".to_string(),
                caption: None,
            },
        };

        let content = resolver.resolve(&subject, "bienvenida", 1, &step).await.unwrap();
        assert_eq!(
            content,
            ResolvedContent::Image {
                url: "https://cdn/panaderia/{{logo}}.png".to_string(),
                caption: None,
            }
        );
    }

    #[tokio::test]
    async fn test_snapshot_hit_skips_generation() {
        let (resolver, generator, _, mut subject) = setup(false).await;
        subject
            .generated_artifacts
            .insert("estrategia".to_string(), "https://files/cached.pdf".to_string());

        let content = resolver
            .resolve(&subject, "bienvenida", 2, &document_step())
            .await
            .unwrap();

        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        match content {
            ResolvedContent::Document { url, file_name, caption } => {
                assert_eq!(url, "https://files/cached.pdf");
                assert_eq!(file_name, "documento.pdf");
                assert_eq!(caption.as_deref(), Some("Tu estrategia, Ana"));
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_generate_once() {
        let (resolver, generator, store, subject) = setup(false).await;
        let step = document_step();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                let subject = subject.clone();
                let step = step.clone();
                tokio::spawn(async move {
                    resolver.resolve(&subject, "bienvenida", 2, &step).await
                })
            })
            .collect();

        let mut urls = Vec::new();
        for task in tasks {
            match task.await.unwrap().unwrap() {
                ResolvedContent::Document { url, .. } => urls.push(url),
                other => panic!("unexpected content: {:?}", other),
            }
        }

        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(urls.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(
            store.find_artifact(subject.id, "estrategia").await.unwrap(),
            Some(urls[0].clone())
        );
    }

    #[tokio::test]
    async fn test_later_miss_uses_stored_artifact() {
        let (resolver, generator, _, subject) = setup(false).await;

        resolver
            .resolve(&subject, "bienvenida", 2, &document_step())
            .await
            .unwrap();
        // Stale snapshot: the subject clone still has no cached artifact
        resolver
            .resolve(&subject, "bienvenida", 2, &document_step())
            .await
            .unwrap();

        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_generation_writes_nothing() {
        let (resolver, _, store, subject) = setup(true).await;

        let result = resolver
            .resolve(&subject, "bienvenida", 2, &document_step())
            .await;

        assert!(matches!(result, Err(GenerationError::Generation(_))));
        assert_eq!(store.find_artifact(subject.id, "estrategia").await.unwrap(), None);
    }

    #[test]
    fn test_default_keys_and_names() {
        assert_eq!(default_content_key("bienvenida", 3), "bienvenida:3");
        assert_eq!(default_file_name("https://files/a/b-1.docx"), "documento.docx");
        assert_eq!(default_file_name("https://files/a/noext"), "documento.pdf");
    }
}
