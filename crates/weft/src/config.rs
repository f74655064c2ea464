//! Translator configuration.
//!
//! Two knobs, both readable from the environment: `strict_mode` re-raises
//! translation failures instead of falling back to default evaluation,
//! and `log_level` bounds trace verbosity (0..=5, matching the levels the
//! translator logs at).

/// Environment variable enabling strict mode ("1"/"true").
pub const STRICT_MODE_ENV: &str = "WEFT_STRICT_MODE";

/// Environment variable setting trace verbosity (0..=5).
pub const LOG_LEVEL_ENV: &str = "WEFT_LOG_LEVEL";

/// Runtime configuration for one [`JitEngine`](crate::JitEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Re-raise any translation error instead of falling back.
    pub strict_mode: bool,
    /// Trace verbosity, 0 (silent) to 5 (per-instruction detail).
    pub log_level: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strict_mode: false,
            log_level: 0,
        }
    }
}

impl Config {
    /// Reads the configuration from the environment, defaulting missing
    /// or unparseable variables.
    #[must_use]
    pub fn from_env() -> Self {
        let strict_mode = std::env::var(STRICT_MODE_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let log_level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .map_or(0, |v| v.min(5));
        Self {
            strict_mode,
            log_level,
        }
    }

    /// Returns a copy with strict mode enabled, for tests.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict_mode = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.strict_mode);
        assert_eq!(config.log_level, 0);
    }

    #[test]
    fn test_strict_builder() {
        assert!(Config::default().strict().strict_mode);
    }
}
