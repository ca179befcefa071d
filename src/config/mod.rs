//! Configuration module
//!
//! TOML file + environment overrides, initialized once at startup:
//!
//! ```ignore
//! // In main():
//! config::init(AppConfig::load(cli.config.as_deref()));
//!
//! // Anywhere in the codebase:
//! let workers = config::get().pipeline.worker_count;
//! ```

pub mod defaults;
mod settings;

pub use settings::*;

use std::sync::OnceLock;

/// Global configuration, initialized once at startup.
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// Should be called exactly once before any call to `get()`; repeated
/// calls are ignored with a warning.
pub fn init(config: AppConfig) {
    if APP_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get the global configuration, falling back to defaults when `init()`
/// has not run (tests, library embedding).
pub fn get() -> &'static AppConfig {
    APP_CONFIG.get_or_init(AppConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    APP_CONFIG.get().is_some()
}
