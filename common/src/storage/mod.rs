// Object storage for generated documents

pub mod documents;
pub mod minio;

pub use documents::MinioDocumentStore;
pub use minio::MinioClient;
