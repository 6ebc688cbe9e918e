use crate::api::ValidationError;
use crate::client::ClientError;
use crate::descheduler::CycleReport;
use crate::framework::registry::RegistryError;
use thiserror::Error;
use validator::ValidationErrors;

#[derive(Error, Debug)]
pub enum DeschedulerError {
    #[error("Error: {0}")]
    String(String),
    #[error("Error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("Error: {}", .0)]
    ValidationErrors(#[from] ValidationErrors),
    #[error("invalid policy: {0}")]
    Validation(#[from] ValidationError),
    #[error("Error: {0}")]
    Registry(#[from] RegistryError),
    #[error("cluster error: {0}")]
    Client(#[from] ClientError),
    #[error("descheduling cycle cancelled after {} evictions", .0.total_evicted)]
    Cancelled(Box<CycleReport>),
}

impl From<String> for DeschedulerError {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}
