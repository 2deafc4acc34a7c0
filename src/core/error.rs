use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported machine type: {0}")]
    UnsupportedMachineType(String),

    #[error("Invalid tool image reference: {0}")]
    InvalidImageReference(String),

    #[error("Invalid user script location: {0}")]
    InvalidUserScript(String),

    #[error("Provisioning service error: {0}")]
    ProvisioningError(String),

    #[error("Another apply is already in progress")]
    ApplyInProgress,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type EnvResult<T> = Result<T, EnvError>;
