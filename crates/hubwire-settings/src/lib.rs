//! # hubwire-settings
//!
//! Configuration for the hubwire server, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`HubSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `HUBWIRE_*` overrides (highest priority)
//!
//! The loaded value is validated before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{HubSection, HubSettings, LoggingSection, ServerSection};
