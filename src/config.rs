use std::fmt::Display;
use std::num::NonZeroUsize;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::bypass::BypassDirective;
use crate::error::ConfigError;

/// How ready tasks are admitted for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Strategy {
    /// One task at a time, in topological order.
    #[default]
    Serial,
    /// A pool of N workers, each running one task exclusively.
    Parallel(NonZeroUsize),
}

impl Strategy {
    /// Parallel strategy sized to the machine.
    pub fn parallel() -> Self {
        Strategy::Parallel(std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN))
    }

    pub fn workers(self) -> usize {
        match self {
            Strategy::Serial => 1,
            Strategy::Parallel(n) => n.get(),
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "serial" => Ok(Strategy::Serial),
            "parallel" => Ok(Strategy::parallel()),
            other => {
                let n = other
                    .strip_prefix("parallel:")
                    .and_then(|n| n.trim().parse::<usize>().ok())
                    .ok_or_else(|| ConfigError::InvalidStrategy(other.to_string()))?;

                NonZeroUsize::new(n)
                    .map(Strategy::Parallel)
                    .ok_or(ConfigError::ZeroWorkers)
            }
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Strategy> for String {
    fn from(value: Strategy) -> Self {
        value.to_string()
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Serial => f.write_str("serial"),
            Strategy::Parallel(n) => write!(f, "parallel:{n}"),
        }
    }
}

/// Options for a single run, passed explicitly to the executor.
///
/// ```toml
/// strategy = "parallel:4"
/// cache = true
/// cache_dir = ".cache/nagare"
///
/// [[bypass]]
/// task = "recon"
/// outputs = { subject = "/data/subjects/arno" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub strategy: Strategy,
    pub bypass: Vec<BypassDirective>,
    /// Consult and fill the cache store.
    pub cache: bool,
    /// Directory of the persistent cache store, in-memory when absent.
    pub cache_dir: Option<Utf8PathBuf>,
    /// Stop admitting any task once one has failed.
    pub abort_on_failure: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Serial,
            bypass: Vec::new(),
            cache: true,
            cache_dir: None,
            abort_on_failure: false,
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&text)?)
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_bypass(mut self, directive: BypassDirective) -> Self {
        self.bypass.push(directive);
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }
}
