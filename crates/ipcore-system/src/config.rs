use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Limits and defaults applied by a [`Core`](crate::Core).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Largest message payload accepted by `write_message`.
    pub max_message_bytes: usize,
    /// Most handles a single message may carry.
    pub max_message_handles: usize,
    /// Messages queued at one endpoint before writes are refused.
    pub max_queued_messages: usize,
    /// Capacity used when a data pipe is created without one.
    pub default_data_pipe_capacity: usize,
    /// Largest data pipe capacity accepted.
    pub max_data_pipe_capacity: usize,
    /// Largest shared buffer accepted.
    pub max_shared_buffer_size: u64,
    /// Most live handles in the table at once.
    pub max_handles: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 4 * 1024 * 1024,
            max_message_handles: 64,
            max_queued_messages: 1024,
            default_data_pipe_capacity: 64 * 1024,
            max_data_pipe_capacity: 16 * 1024 * 1024,
            max_shared_buffer_size: 64 * 1024 * 1024,
            max_handles: 64 * 1024,
        }
    }
}

impl CoreConfig {
    /// Check that the limits are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.max_handles < 2 {
            return Err(CoreError::invalid("max_handles must allow at least one pipe"));
        }
        if self.max_queued_messages == 0 {
            return Err(CoreError::invalid("max_queued_messages must be non-zero"));
        }
        if self.default_data_pipe_capacity == 0 {
            return Err(CoreError::invalid(
                "default_data_pipe_capacity must be non-zero",
            ));
        }
        if self.default_data_pipe_capacity > self.max_data_pipe_capacity {
            return Err(CoreError::invalid(format!(
                "default_data_pipe_capacity ({}) exceeds max_data_pipe_capacity ({})",
                self.default_data_pipe_capacity, self.max_data_pipe_capacity
            )));
        }
        if self.max_shared_buffer_size == 0 {
            return Err(CoreError::invalid("max_shared_buffer_size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_default_capacity_above_max() {
        let config = CoreConfig {
            default_data_pipe_capacity: 2048,
            max_data_pipe_capacity: 1024,
            ..CoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{ "max_queued_messages": 8 }"#).unwrap();
        assert_eq!(config.max_queued_messages, 8);
        assert_eq!(config.max_message_handles, 64);
        assert!(config.validate().is_ok());
    }
}
