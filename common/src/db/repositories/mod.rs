// Repository layer for database operations

pub mod artifact;
pub mod enrollment;
pub mod subject;

pub use artifact::ArtifactRepository;
pub use enrollment::EnrollmentRepository;
pub use subject::SubjectRepository;
