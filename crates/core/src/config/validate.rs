use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Budget ceilings are positive and one chunk fits the scratch budget
/// - Job size limits are positive and fit the store's integer columns
/// - Failed-fraction tolerance lies in [0, 1]
/// - Retry backoff never shrinks
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let budget = config.budget.resolve();
    if budget.max_concurrent_chunks == 0 {
        return Err(ConfigError::ValidationError(
            "budget.max_concurrent_chunks must be greater than 0".to_string(),
        ));
    }
    if budget.max_scratch_bytes == 0 {
        return Err(ConfigError::ValidationError(
            "budget.max_scratch_bytes must be greater than 0".to_string(),
        ));
    }
    if budget.chunk_item_count == 0 {
        return Err(ConfigError::ValidationError(
            "budget.chunk_item_count must be greater than 0".to_string(),
        ));
    }
    if budget.required_bytes(budget.chunk_item_count) > budget.max_scratch_bytes {
        return Err(ConfigError::ValidationError(format!(
            "a chunk of {} items needs {} bytes, more than budget.max_scratch_bytes ({})",
            budget.chunk_item_count,
            budget.required_bytes(budget.chunk_item_count),
            budget.max_scratch_bytes
        )));
    }

    if config.aggregation.max_requested_items == 0
        || config.aggregation.max_requested_items > i64::MAX as u64
    {
        return Err(ConfigError::ValidationError(format!(
            "aggregation.max_requested_items must be between 1 and {}",
            i64::MAX
        )));
    }
    if config.aggregation.max_chunks_per_job == 0 {
        return Err(ConfigError::ValidationError(
            "aggregation.max_chunks_per_job must be greater than 0".to_string(),
        ));
    }

    if let Some(fraction) = config.aggregation.max_failed_fraction {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::ValidationError(
                "aggregation.max_failed_fraction must be between 0 and 1".to_string(),
            ));
        }
    }

    if config.retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::ValidationError(
            "retry.backoff_multiplier must be at least 1".to_string(),
        ));
    }

    if config.worker.pool_size == 0 {
        return Err(ConfigError::ValidationError(
            "worker.pool_size must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".parse().unwrap(),
                port: 0,
            },
            ..Config::default()
        };
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_zero_concurrency_fails() {
        let mut config = Config::default();
        config.budget.max_concurrent_chunks = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_chunk_larger_than_scratch_fails() {
        let mut config = Config::default();
        config.budget.max_scratch_bytes = Some(1024);
        config.budget.estimated_bytes_per_item = Some(1024);
        config.budget.chunk_item_count = Some(2);
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_scratch_bytes"));
    }

    #[test]
    fn test_validate_fraction_out_of_range_fails() {
        let mut config = Config::default();
        config.aggregation.max_failed_fraction = Some(1.5);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_job_size_limits() {
        let mut config = Config::default();
        config.aggregation.max_requested_items = u64::MAX;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.aggregation.max_chunks_per_job = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_shrinking_backoff_fails() {
        let mut config = Config::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());
    }
}
