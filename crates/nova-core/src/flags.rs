//! Feature-flag lookup for conditionally wired modules

use std::collections::HashMap;

use crate::NovaConfig;

/// Read access to an external feature-flag store
pub trait FlagStore: Send + Sync {
    /// Explicit flag value, or `None` when the store has no opinion
    fn get(&self, flag: &str) -> Option<bool>;
}

/// Flag store backed by a fixed map
#[derive(Debug, Clone, Default)]
pub struct StaticFlags {
    flags: HashMap<String, bool>,
}

impl StaticFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: impl Into<String>, enabled: bool) -> Self {
        self.flags.insert(flag.into(), enabled);
        self
    }
}

impl FlagStore for StaticFlags {
    fn get(&self, flag: &str) -> Option<bool> {
        self.flags.get(flag).copied()
    }
}

/// Decide whether a module is wired into the build
///
/// Precedence: an explicit value in the flag store wins (so a flag disabled
/// there overrides every other signal), then the `[features]` table of the
/// configuration, then the module's own default.
pub fn module_enabled(
    flags: &dyn FlagStore,
    config: &NovaConfig,
    flag: &str,
    module_default: bool,
) -> bool {
    flags
        .get(flag)
        .or_else(|| config.feature_enabled(flag))
        .unwrap_or(module_default)
}
