//! Engine configuration.
//!
//! An [`EngineConfig`] is created and edited by the configuration layer of
//! the host application and is read-only to this crate once passed in. The
//! `locked` flag transitions `false -> true` exactly once, when the config
//! is first used to build a pool, and never back.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Where an engine runs and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineLocality {
    /// A local engine binary, launched as `<binary> -p <address>:<port>`.
    Local {
        /// Filesystem path of the engine binary.
        binary: PathBuf,
        /// Address the engine binds to, usually loopback.
        address: String,
    },
    /// A remote engine already listening on the configured port range.
    Remote {
        /// Host address of the remote engine.
        address: String,
    },
}

/// Configuration of one named verification engine.
#[derive(Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Unique engine name.
    pub name: String,
    /// Local process or remote host.
    pub locality: EngineLocality,
    /// First port of the inclusive port range.
    pub port_start: u16,
    /// Last port of the inclusive port range.
    pub port_end: u16,
    /// Whether the engine supports concurrent use of one connection.
    ///
    /// This is a cooperative contract: the pool shares a connection across
    /// in-flight requests without proving that the stub tolerates it.
    pub thread_safe: bool,
    /// Whether this engine is the default selection.
    pub default_engine: bool,
    #[serde(skip)]
    locked: AtomicBool,
}

impl EngineConfig {
    /// Creates a config for the given engine.
    #[must_use]
    pub fn new(name: impl Into<String>, locality: EngineLocality, port_start: u16, port_end: u16) -> Self {
        Self {
            name: name.into(),
            locality,
            port_start,
            port_end,
            thread_safe: false,
            default_engine: false,
            locked: AtomicBool::new(false),
        }
    }

    /// Validates the config.
    ///
    /// This must be called before the config is used to build a pool.
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.is_empty() {
            return Err(EngineError::Protocol {
                message: "engine name must not be empty".to_string(),
            });
        }
        if self.port_end < self.port_start {
            return Err(EngineError::Protocol {
                message: format!(
                    "invalid port range [{}, {}] for engine '{}'",
                    self.port_start, self.port_end, self.name
                ),
            });
        }
        Ok(())
    }

    /// Address the engine is reachable on (bind address for local engines).
    #[must_use]
    pub fn address(&self) -> &str {
        match &self.locality {
            EngineLocality::Local { address, .. } | EngineLocality::Remote { address } => address,
        }
    }

    /// Returns true for a local engine launched by this crate.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.locality, EngineLocality::Local { .. })
    }

    /// Number of ports in the inclusive range, an upper bound on the
    /// connections this engine can serve.
    #[must_use]
    pub const fn port_range_width(&self) -> usize {
        (self.port_end as usize) - (self.port_start as usize) + 1
    }

    /// Iterator over the inclusive port range.
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.port_start..=self.port_end
    }

    /// Marks the config as in use. One-way: once locked, never unlocked.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    /// Whether the config has ever been used to build a pool.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl Clone for EngineConfig {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            locality: self.locality.clone(),
            port_start: self.port_start,
            port_end: self.port_end,
            thread_safe: self.thread_safe,
            default_engine: self.default_engine,
            locked: AtomicBool::new(self.is_locked()),
        }
    }
}
