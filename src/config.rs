use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub retry_max_attempts: u32,
    pub retry_delay: Duration,
    pub cache_ttl: Duration,
    pub audit_log_path: Option<String>,
    pub busy_timeout: Duration,
    pub max_concurrency: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let retry_max_attempts = parse_or(&env_map, "RETRY_MAX_ATTEMPTS", "3", "u32")?;
        if retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RETRY_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let retry_delay_ms: u64 = parse_or(&env_map, "RETRY_DELAY_MS", "2000", "u64")?;
        let cache_ttl_secs: u64 = parse_or(&env_map, "CACHE_TTL_SECS", "300", "u64")?;
        let busy_timeout_ms: u64 = parse_or(&env_map, "BUSY_TIMEOUT_MS", "5000", "u64")?;

        let max_concurrency = parse_or(&env_map, "MAX_CONCURRENCY", "8", "usize")?;
        if max_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let audit_log_path = env_map
            .get("AUDIT_LOG_PATH")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Config {
            database_path,
            retry_max_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            audit_log_path,
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            max_concurrency,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
    type_name: &str,
) -> Result<T, ConfigError> {
    env_map
        .get(key)
        .map(|s| s.as_str())
        .unwrap_or(default)
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), format!("must be a valid {}", type_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/users.db".to_string());
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.database_path, "/tmp/users.db");
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrency, 8);
        assert!(config.audit_log_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut env_map = setup_required_env();
        env_map.insert("RETRY_MAX_ATTEMPTS".to_string(), "5".to_string());
        env_map.insert("RETRY_DELAY_MS".to_string(), "250".to_string());
        env_map.insert("CACHE_TTL_SECS".to_string(), "60".to_string());
        env_map.insert("AUDIT_LOG_PATH".to_string(), "/var/log/audit.log".to_string());
        env_map.insert("MAX_CONCURRENCY".to_string(), "2".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.audit_log_path.as_deref(), Some("/var/log/audit.log"));
        assert_eq!(config.max_concurrency, 2);
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_invalid_retry_delay() {
        let mut env_map = setup_required_env();
        env_map.insert("RETRY_DELAY_MS".to_string(), "soon".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "RETRY_DELAY_MS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("RETRY_MAX_ATTEMPTS".to_string(), "0".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "RETRY_MAX_ATTEMPTS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("MAX_CONCURRENCY".to_string(), "0".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "MAX_CONCURRENCY"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_blank_audit_path_is_absent() {
        let mut env_map = setup_required_env();
        env_map.insert("AUDIT_LOG_PATH".to_string(), "  ".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert!(config.audit_log_path.is_none());
    }
}
