use thiserror::Error;

/// Failure of a run-store backend. Carries the backend's message; callers
/// only log or propagate it.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("run store query failed: {0}")]
    Query(String),

    #[error("run snapshot could not be (de)serialized: {0}")]
    Serialization(String),
}
