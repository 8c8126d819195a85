//! Per-operation context handed to every provider call.

use crate::config::Config;

/// Wraps the configuration resolved for a single logical operation.
///
/// A context is built by the caller for each operation and is not shared
/// between concurrent operations.
#[derive(Debug, Clone)]
pub struct Context {
    config: Config,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl From<Config> for Context {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}
