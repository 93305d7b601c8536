use thiserror::Error;

use crate::JobId;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Bus error: {0}")]
    BusError(String),
    #[error("Query error: {0}")]
    QueryError(String),
    #[error("Credential error: {0}")]
    CredentialError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Submit failed after {} cluster(s): {reason}", submitted.len())]
    SubmitError { submitted: Vec<JobId>, reason: String },
    #[error("Error: {0}")]
    GenericError(String),
}

impl FactoryError {
    /// Jobs that made it into the queue before the failure, if any.
    pub fn submitted_jobs(&self) -> &[JobId] {
        match self {
            FactoryError::SubmitError { submitted, .. } => submitted,
            _ => &[],
        }
    }
}

pub fn generic_error<T>(message: String) -> crate::Result<T> {
    Err(FactoryError::GenericError(message))
}

impl From<anyhow::Error> for FactoryError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<String> for FactoryError {
    fn from(e: String) -> Self {
        FactoryError::GenericError(e)
    }
}
