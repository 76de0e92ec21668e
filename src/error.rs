use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Initialization error: {message}")]
    Initialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Poison message: {message}")]
    PoisonMessage { message: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Queue not found: {name}")]
    QueueNotFound { name: String },

    #[error("Queue already registered: {name}")]
    QueueAlreadyRegistered { name: String },

    #[error("Handler already registered for queue: {name}")]
    HandlerAlreadyRegistered { name: String },

    #[error("Adapter '{adapter}' is not available: build with the '{feature}' feature")]
    AdapterUnavailable { adapter: String, feature: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("State error: {message}")]
    State { message: String },

    #[error("Failed to close {} queue(s): {}", .failures.len(), .failures.join("; "))]
    Shutdown { failures: Vec<String> },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConveyorError {
    /// Builds the error a job handler returns to mark its job as failed.
    pub fn handler(message: impl Into<String>) -> Self {
        ConveyorError::Handler {
            message: message.into(),
        }
    }

    pub fn connection(message: impl std::fmt::Display) -> Self {
        ConveyorError::Connection {
            message: message.to_string(),
        }
    }

    pub fn queue(message: impl std::fmt::Display) -> Self {
        ConveyorError::Queue {
            message: message.to_string(),
        }
    }

    /// The message recorded as a job's `failed_reason`.
    ///
    /// Handler errors are recorded without the variant prefix so the reason reads
    /// exactly as the handler produced it.
    pub fn failure_reason(&self) -> String {
        match self {
            ConveyorError::Handler { message } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<toml::de::Error> for ConveyorError {
    fn from(err: toml::de::Error) -> Self {
        ConveyorError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for ConveyorError {
    fn from(err: toml::ser::Error) -> Self {
        ConveyorError::Config(format!("TOML serialization error: {}", err))
    }
}
