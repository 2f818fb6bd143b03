//! Process configuration from environment variables.
//!
//! Event settings (title, dates, captcha toggle) live in the settings JSON
//! file instead; this only covers where files live and housekeeping timers.

use std::path::PathBuf;
use std::time::Duration;

/// Captcha sweep interval (20 minutes)
pub const DEFAULT_CAPTCHA_SWEEP_SECS: u64 = 20 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub settings_path: PathBuf,
    pub entries_path: PathBuf,
    pub static_dir: PathBuf,
    pub captcha_sweep_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("settings.json"),
            entries_path: PathBuf::from("entries.json"),
            static_dir: PathBuf::from("static"),
            captcha_sweep_interval: Duration::from_secs(DEFAULT_CAPTCHA_SWEEP_SECS),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let path_var = |name: &str, default: PathBuf| {
            std::env::var(name)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(default)
        };

        let captcha_sweep_interval = std::env::var("JAMTHEMES_CAPTCHA_SWEEP_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.captcha_sweep_interval);

        let config = Self {
            settings_path: path_var("JAMTHEMES_SETTINGS_PATH", defaults.settings_path),
            entries_path: path_var("JAMTHEMES_ENTRIES_PATH", defaults.entries_path),
            static_dir: path_var("JAMTHEMES_STATIC_DIR", defaults.static_dir),
            captcha_sweep_interval,
        };

        tracing::info!(
            settings = %config.settings_path.display(),
            entries = %config.entries_path.display(),
            static_dir = %config.static_dir.display(),
            sweep_secs = config.captcha_sweep_interval.as_secs(),
            "Config loaded"
        );

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = [
        "JAMTHEMES_SETTINGS_PATH",
        "JAMTHEMES_ENTRIES_PATH",
        "JAMTHEMES_STATIC_DIR",
        "JAMTHEMES_CAPTCHA_SWEEP_SECS",
    ];

    fn clear_vars() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_vars();
        assert_eq!(AppConfig::from_env(), AppConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_vars();
        std::env::set_var("JAMTHEMES_SETTINGS_PATH", "/data/settings.json");
        std::env::set_var("JAMTHEMES_ENTRIES_PATH", " ");
        std::env::set_var("JAMTHEMES_CAPTCHA_SWEEP_SECS", "90");

        let config = AppConfig::from_env();
        assert_eq!(config.settings_path, PathBuf::from("/data/settings.json"));
        assert_eq!(config.entries_path, PathBuf::from("entries.json"));
        assert_eq!(config.captcha_sweep_interval, Duration::from_secs(90));

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_zero_sweep_interval_falls_back() {
        clear_vars();
        std::env::set_var("JAMTHEMES_CAPTCHA_SWEEP_SECS", "0");

        assert_eq!(
            AppConfig::from_env().captcha_sweep_interval,
            Duration::from_secs(DEFAULT_CAPTCHA_SWEEP_SECS)
        );

        clear_vars();
    }
}
