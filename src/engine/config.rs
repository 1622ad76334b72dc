//! Reference engine configuration.

/// Configuration for a [`super::ReferenceEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reject binds whose arrays live on a different context than the bind.
    pub strict_contexts: bool,
    /// Upper bound on shape propagation sweeps before giving up.
    pub max_infer_passes: usize,
    /// Whether to log every forward pass.
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_contexts: true,
            max_infer_passes: 16,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Creates a new EngineConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether mismatched array contexts fail a bind.
    pub fn strict_contexts(mut self, strict: bool) -> Self {
        self.strict_contexts = strict;
        self
    }

    /// Sets the shape propagation sweep limit.
    pub fn max_infer_passes(mut self, passes: usize) -> Self {
        self.max_infer_passes = passes;
        self
    }

    /// Sets whether to log forward passes.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.strict_contexts);
        assert_eq!(config.max_infer_passes, 16);
        assert!(!config.verbose);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .strict_contexts(false)
            .max_infer_passes(4)
            .verbose(true);

        assert!(!config.strict_contexts);
        assert_eq!(config.max_infer_passes, 4);
        assert!(config.verbose);
    }
}
