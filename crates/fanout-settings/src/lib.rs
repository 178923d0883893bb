//! # fanout-settings
//!
//! Configuration for the fanout server and publisher client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FanoutSettings::default()`]
//! 2. **Settings file**: `~/.fanout/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `FANOUT_*` overrides (highest priority)
//!
//! The result is validated before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{ClientSettings, FanoutSettings, LoggingSettings, ServerSettings};
