//! Configuration file resolution.
//!
//! Priority:
//! 1. `--config <path>`
//! 2. `SIGHTLINE_CONFIG` (ignored when empty)
//! 3. `<config dir>/sightline/config.json`, if it exists
//! 4. built-in defaults
//!
//! An explicitly named file that can't be loaded is an error; only the
//! implicit per-user file may be absent.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sightline_core::config::ConfigHandle;
use tracing::debug;

pub const CONFIG_ENV: &str = "SIGHTLINE_CONFIG";

/// Per-user configuration file location, whether or not it exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sightline").join("config.json"))
}

/// The configuration file to load, if any.
pub fn config_path(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    user_config_path().filter(|p| p.is_file())
}

pub fn load_config(flag: Option<&Path>) -> Result<ConfigHandle> {
    match config_path(flag) {
        Some(path) => ConfigHandle::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            debug!("no configuration file, using defaults");
            Ok(ConfigHandle::defaults())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var manipulation is process-global; tests touching it run serially.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars, _lock: lock }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                // SAFETY: ENV_MUTEX is held, no other test thread touches the environment
                unsafe {
                    match value {
                        Some(v) => env::set_var(name, v),
                        None => env::remove_var(name),
                    }
                }
            }
        }
    }

    #[test]
    fn flag_wins_over_environment() {
        let _guard = EnvGuard::new(&[CONFIG_ENV]);
        // SAFETY: ENV_MUTEX is held via _guard
        unsafe { env::set_var(CONFIG_ENV, "/from/env.json") };

        assert_eq!(
            config_path(Some(Path::new("/from/flag.json"))),
            Some(PathBuf::from("/from/flag.json"))
        );
        assert_eq!(config_path(None), Some(PathBuf::from("/from/env.json")));
    }

    #[test]
    fn empty_environment_value_is_ignored() {
        let _guard = EnvGuard::new(&[CONFIG_ENV]);
        // SAFETY: ENV_MUTEX is held via _guard
        unsafe { env::set_var(CONFIG_ENV, "") };

        let resolved = config_path(None);
        assert_ne!(resolved, Some(PathBuf::new()));
        if let Some(path) = resolved {
            assert!(path.ends_with("sightline/config.json"));
        }
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let _guard = EnvGuard::new(&[CONFIG_ENV]);
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");

        let err = load_config(Some(&missing)).unwrap_err();
        assert!(format!("{:#}", err).contains("nope.json"));
    }

    #[test]
    fn loads_file_from_environment() {
        let _guard = EnvGuard::new(&[CONFIG_ENV]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sightline.json");
        std::fs::write(&path, r#"{"automation":{"max_retries":7}}"#).unwrap();
        // SAFETY: ENV_MUTEX is held via _guard
        unsafe { env::set_var(CONFIG_ENV, &path) };

        let handle = load_config(None).unwrap();
        assert_eq!(handle.config().automation.max_retries, 7);
        assert_eq!(handle.path(), Some(path.as_path()));
    }
}
