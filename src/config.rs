use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use dotenvy::dotenv;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub write_batch_size: usize,
    pub read_page_size: usize,
    pub cache_ttl: Duration,
    pub retry_delay: Duration,
    pub corporate_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            write_batch_size: 200,
            read_page_size: 1000,
            cache_ttl: Duration::from_secs(300),
            retry_delay: Duration::from_millis(2000),
            corporate_domain: "@edu.hse.ru".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load from .env file if available
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        Ok(Config {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?,
            write_batch_size: parse_var(&lookup, "WRITE_BATCH_SIZE", defaults.write_batch_size)?,
            read_page_size: parse_var(&lookup, "READ_PAGE_SIZE", defaults.read_page_size)?,
            cache_ttl: Duration::from_secs(parse_var(
                &lookup,
                "CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )?),
            retry_delay: Duration::from_millis(parse_var(
                &lookup,
                "RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )?),
            corporate_domain: lookup("CORPORATE_DOMAIN").unwrap_or(defaults.corporate_domain),
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL must be set"))
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.write_batch_size, 200);
        assert_eq!(config.read_page_size, 1000);
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.retry_delay, Duration::from_millis(2000));
        assert_eq!(config.corporate_domain, "@edu.hse.ru");
        assert!(config.database_url().is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/grades"),
            ("WRITE_BATCH_SIZE", "50"),
            ("RETRY_DELAY_MS", "10"),
        ])
        .unwrap();
        assert_eq!(config.database_url().unwrap(), "postgres://localhost/grades");
        assert_eq!(config.write_batch_size, 50);
        assert_eq!(config.retry_delay, Duration::from_millis(10));
    }

    #[test]
    fn invalid_value_names_the_variable() {
        let err = config_from(&[("READ_PAGE_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("READ_PAGE_SIZE"));
    }
}
