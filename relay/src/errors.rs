// Error handling framework for the application context

use thiserror::Error;

/// Settings and configuration-source errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Setting not found: {0}")]
    NotFound(String),

    #[error("Improperly configured: {0}")]
    Configuration(String),

    #[error("Cannot import configuration module '{0}'")]
    Import(String),

    #[error("Failed to read configuration source: {0}")]
    Source(String),
}

/// Broker connection, pooling and publishing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("No transport registered for '{0}'")]
    UnknownTransport(String),

    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Connection pool exhausted (limit {limit})")]
    PoolExhausted { limit: usize },

    #[error("Failed to publish message: {0}")]
    Publish(String),

    #[error("Cannot route message: {0}")]
    Routing(String),

    #[error("Message serialization failed: {0}")]
    Serialization(String),
}

/// Task definition and invocation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Task of kind '{0}' is not registered")]
    NotRegistered(String),

    #[error("Invalid task options: {0}")]
    InvalidOptions(String),

    #[error("Task {task} failed: {reason}")]
    Failed { task: String, reason: String },
}

/// Top-level error returned by operations on the application context
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Publish(err.to_string())
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Source(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ConfigError::NotFound("FOO".to_string());
        assert_eq!(err.to_string(), "Setting not found: FOO");
    }

    #[test]
    fn test_pool_exhausted_display() {
        let err = BrokerError::PoolExhausted { limit: 10 };
        assert!(err.to_string().contains("limit 10"));
    }

    #[test]
    fn test_app_error_is_transparent() {
        let err: AppError = BrokerError::Routing("no routing key".to_string()).into();
        assert_eq!(err.to_string(), "Cannot route message: no routing key");
        assert!(matches!(err, AppError::Broker(BrokerError::Routing(_))));
    }

    #[test]
    fn test_config_crate_error_maps_to_source() {
        let err: ConfigError = config::ConfigError::Message("bad file".to_string()).into();
        assert!(matches!(err, ConfigError::Source(_)));
    }
}
