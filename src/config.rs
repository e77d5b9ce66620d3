//! Store configuration

use crate::error::{Result, StoreError};
use crate::persist::BatcherConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for a [`DomainStore`](crate::store::DomainStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Deferred persistence I/O
    #[serde(default)]
    pub batcher: BatcherConfig,

    /// Messages kept in memory before least recently used ones are evicted
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,

    /// Width of one message page in seconds
    #[serde(default = "default_page_window_secs")]
    pub page_window_secs: i64,
}

fn default_message_capacity() -> usize { 5000 }
fn default_page_window_secs() -> i64 { 24 * 60 * 60 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
            message_capacity: default_message_capacity(),
            page_window_secs: default_page_window_secs(),
        }
    }
}

impl StoreConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        info!(
            batch_size = config.batcher.batch_size,
            message_capacity = config.message_capacity,
            page_window_secs = config.page_window_secs,
            "Loaded store config"
        );
        Ok(config)
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `CHAT_STORE_*` variables. Each override is logged; unparseable
    /// values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse(&lookup, "CHAT_STORE_BATCH_SIZE") {
            config.batcher.batch_size = n;
        }
        if let Some(ms) = parse(&lookup, "CHAT_STORE_FLUSH_DELAY_MS") {
            config.batcher.flush_delay_ms = ms;
        }
        if let Some(n) = parse(&lookup, "CHAT_STORE_WRITE_CONCURRENCY") {
            config.batcher.write_concurrency = n;
        }
        if let Some(n) = parse(&lookup, "CHAT_STORE_READ_CONCURRENCY") {
            config.batcher.read_concurrency = n;
        }
        if let Some(n) = parse(&lookup, "CHAT_STORE_MESSAGE_CAPACITY") {
            config.message_capacity = n;
        }
        if let Some(secs) = parse(&lookup, "CHAT_STORE_PAGE_WINDOW_SECS") {
            config.page_window_secs = secs;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        self.batcher.validate()?;
        if self.message_capacity == 0 {
            return Err(StoreError::Config("message_capacity must be non-zero".into()));
        }
        if self.page_window_secs <= 0 {
            return Err(StoreError::Config("page_window_secs must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => {
            info!(var = name, value = %raw.trim(), "Config override from environment");
            Some(value)
        }
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparseable config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.batcher.batch_size, 50);
        assert_eq!(config.batcher.flush_delay_ms, 16);
        assert_eq!(config.message_capacity, 5000);
        assert_eq!(config.page_window_secs, 86_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = StoreConfig::from_toml(
            r#"
            message_capacity = 200

            [batcher]
            batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.message_capacity, 200);
        assert_eq!(config.batcher.batch_size, 10);
        assert_eq!(config.batcher.write_concurrency, 4);
        assert_eq!(config.page_window_secs, 86_400);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(matches!(
            StoreConfig::from_toml("page_window_secs = 0"),
            Err(StoreError::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml("message_capacity = \"lots\""),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHAT_STORE_BATCH_SIZE", "25"),
            ("CHAT_STORE_FLUSH_DELAY_MS", " 4 "),
            ("CHAT_STORE_MESSAGE_CAPACITY", "not a number"),
        ]
        .into_iter()
        .collect();
        let config = StoreConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.batcher.batch_size, 25);
        assert_eq!(config.batcher.flush_delay_ms, 4);
        assert_eq!(config.message_capacity, 5000);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_env_overrides_are_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            StoreConfig::from_lookup(|name| match name {
                "CHAT_STORE_READ_CONCURRENCY" => Some("2".to_string()),
                "CHAT_STORE_PAGE_WINDOW_SECS" => Some("soon".to_string()),
                _ => None,
            });
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("CHAT_STORE_READ_CONCURRENCY"));
        assert!(output.contains("Config override from environment"));
        assert!(output.contains("Ignoring unparseable config override"));
        assert!(!output.contains("CHAT_STORE_BATCH_SIZE"));
    }
}
