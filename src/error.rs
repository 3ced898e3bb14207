use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("collector already running")]
    AlreadyRunning,

    #[error("collector not running")]
    NotRunning,

    #[error("cannot intern an empty stack")]
    EmptyStack,
}
