// Document store on MinIO

use crate::errors::GenerationError;
use crate::generation::DocumentStore;
use crate::models::RenderedDocument;
use crate::storage::MinioClient;
use async_trait::async_trait;
use tracing::{info, instrument};
use uuid::Uuid;

/// Uploads rendered documents to MinIO and hands out their public URLs
pub struct MinioDocumentStore {
    client: MinioClient,
}

impl MinioDocumentStore {
    pub fn new(client: MinioClient) -> Self {
        Self { client }
    }

    /// Object path format: documents/{subject_id}/{sanitized_key}-{uuid}.{ext}
    fn document_path(subject_id: Uuid, content_key: &str, extension: &str) -> String {
        format!(
            "documents/{}/{}-{}.{}",
            subject_id,
            sanitize_key(content_key),
            Uuid::new_v4(),
            extension
        )
    }
}

/// Keep `[A-Za-z0-9_-]`, replace anything else with '-'
fn sanitize_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "document".to_string()
    } else {
        sanitized
    }
}

#[async_trait]
impl DocumentStore for MinioDocumentStore {
    #[instrument(skip(self, document), fields(size = document.bytes.len()))]
    async fn store(
        &self,
        subject_id: Uuid,
        content_key: &str,
        document: &RenderedDocument,
    ) -> Result<String, GenerationError> {
        let path = Self::document_path(subject_id, content_key, &document.extension);

        self.client
            .put_object(&path, &document.bytes, &document.content_type)
            .await
            .map_err(|e| GenerationError::Upload(e.to_string()))?;

        let reference = self.client.public_url(&path);
        info!(path = %path, "Generated document uploaded");
        Ok(reference)
    }
}
