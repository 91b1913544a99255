//! Layered configuration for the parley server.
//!
//! Settings are resolved from, lowest priority first:
//! 1. compiled defaults ([`ParleySettings::default()`])
//! 2. `~/.parley/settings.json` (or an explicit path), deep-merged over the defaults
//! 3. `PARLEY_*` environment variables

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
