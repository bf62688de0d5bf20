pub mod stack;

use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub use stack::StackConfig;

/// Process-level settings, layered from `config/local.*` and `MUSTER__*` variables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MusterConfig {
    #[serde(default)]
    pub stack_path: Option<String>,
    #[serde(default)]
    pub max_parallel_starts: Option<usize>,
    #[serde(default)]
    pub detach: bool,
}

impl MusterConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("MUSTER").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Applies process-level overrides on top of the stack file's `app` section.
    pub fn apply_overrides(&self, stack: &mut StackConfig) {
        if let Some(limit) = self.max_parallel_starts.filter(|limit| *limit > 0) {
            stack.app.max_parallel_starts = limit;
        }
    }
}
