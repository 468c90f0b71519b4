//! # marblebar-settings
//!
//! Configuration with layered sources for the MarbleBar client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MarbleSettings::default()`]
//! 2. **User file**: `~/.marblebar/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `MARBLEBAR_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path, validate};
pub use types::{ClientSettings, LoggingSettings, MarbleSettings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = MarbleSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = MarbleSettings::default();
        assert_eq!(settings.client.endpoint, "ws://127.0.0.1:15234");
        assert_eq!(settings.client.connect_timeout_ms, 500);
        assert_eq!(settings.client.reply_timeout_ms, 10_000);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.json);
    }
}
