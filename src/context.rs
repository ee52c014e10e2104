//! Per-invocation context handed to every component constructor.

use std::sync::Arc;

use crate::config::Config;
use crate::log::{LogLevel, Logger};

#[derive(Debug, Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub log: Logger,
}

impl Context {
    pub fn new(config: Config, log: Logger) -> Self {
        Self {
            config: Arc::new(config),
            log,
        }
    }

    /// Default configuration with an in-memory logger.
    pub fn for_tests() -> Self {
        Self::new(Config::default(), Logger::memory(LogLevel::Debug))
    }
}
