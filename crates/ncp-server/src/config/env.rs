// crates/ncp-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;
use tracing::{debug, warn};

/// Default profile used when `NCP_PROFILE` is unset.
pub const DEFAULT_PROFILE: &str = "all";

/// All environment-driven settings, loaded once at startup and passed
/// explicitly to the components that need them.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Configuration directory (NCP_CONFIG_PATH, default `~/.ncp`).
    pub config_dir: PathBuf,
    /// Active profile at startup (NCP_PROFILE, default `all`).
    pub profile: String,
    /// Verbose logging (NCP_DEBUG).
    pub debug: bool,
    /// Skip downstream connects and scheduler timers (NCP_DISABLE_BACKGROUND_INIT).
    pub disable_background_init: bool,
    /// CLI-only prompt gate (NCP_CONFIRM_BEFORE_RUN); parsed here so there is
    /// one reader for every NCP_* variable, acted on by the CLI alone.
    pub confirm_before_run: bool,
}

/// Result of validating the loaded configuration.
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Self {
        let config_dir = std::env::var("NCP_CONFIG_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_config_dir);

        let profile = std::env::var("NCP_PROFILE")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        let config = Self {
            config_dir,
            profile,
            debug: parse_bool_env("NCP_DEBUG").unwrap_or(false),
            disable_background_init: parse_bool_env("NCP_DISABLE_BACKGROUND_INIT")
                .unwrap_or(false),
            confirm_before_run: parse_bool_env("NCP_CONFIRM_BEFORE_RUN").unwrap_or(false),
        };

        debug!(
            config_dir = %config.config_dir.display(),
            profile = %config.profile,
            "Environment configuration loaded"
        );
        config
    }

    /// Validate the configuration, returning warnings for anything suspect.
    /// Nothing here is fatal; the caller decides what to do with warnings.
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::default();

        if let Err(e) = std::fs::create_dir_all(&self.config_dir) {
            validation.warnings.push(format!(
                "Config directory {} is not writable: {}",
                self.config_dir.display(),
                e
            ));
        }

        if self.disable_background_init {
            validation
                .warnings
                .push("NCP_DISABLE_BACKGROUND_INIT is set; downstreams will not be connected".into());
        }

        validation
    }

    /// `<configDir>/profiles`
    pub fn profiles_dir(&self) -> PathBuf {
        self.config_dir.join("profiles")
    }

    /// `<configDir>/cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir.join("cache")
    }

    /// `<configDir>/schedule.json`
    pub fn schedule_path(&self) -> PathBuf {
        self.config_dir.join("schedule.json")
    }

    /// `<configDir>/executions.json`
    pub fn executions_path(&self) -> PathBuf {
        self.config_dir.join("executions.json")
    }
}

fn default_config_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".ncp"),
        None => {
            warn!("No home directory found; using ./.ncp for configuration");
            PathBuf::from(".ncp")
        }
    }
}

/// Parse a boolean environment variable.
/// Accepts: 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        other => {
            warn!("Unknown value for {}: {:?}, ignoring", name, other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env_variants() {
        // Unique var names to avoid cross-test interference.
        unsafe {
            std::env::set_var("NCP_TEST_BOOL_TRUE", "Yes");
            std::env::set_var("NCP_TEST_BOOL_FALSE", "off");
            std::env::set_var("NCP_TEST_BOOL_JUNK", "maybe");
        }
        assert_eq!(parse_bool_env("NCP_TEST_BOOL_TRUE"), Some(true));
        assert_eq!(parse_bool_env("NCP_TEST_BOOL_FALSE"), Some(false));
        assert_eq!(parse_bool_env("NCP_TEST_BOOL_JUNK"), None);
        assert_eq!(parse_bool_env("NCP_TEST_BOOL_UNSET"), None);
    }

    #[test]
    fn test_derived_paths() {
        let config = EnvConfig {
            config_dir: PathBuf::from("/tmp/ncp-test"),
            profile: DEFAULT_PROFILE.into(),
            debug: false,
            disable_background_init: true,
            confirm_before_run: false,
        };
        assert_eq!(config.profiles_dir(), PathBuf::from("/tmp/ncp-test/profiles"));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/ncp-test/cache"));
        assert!(config.schedule_path().ends_with("schedule.json"));
    }
}
