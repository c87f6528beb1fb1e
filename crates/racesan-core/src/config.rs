//! Runtime configuration.
//!
//! Options are read once, at initialization, from environment variables:
//! - `RACESAN_SHADOW`: `fixed` (default) reserves shadow at the built-in
//!   addresses; `relocatable` lets the kernel choose the shadow base.
//! - `RACESAN_APP_RANGE`: `<beg>-<end>` in hex, the monitored application
//!   window. Only honored in relocatable mode.
//! - `RACESAN_HALT_ON_ERROR`: exit after the first reported race.
//! - `RACESAN_VERBOSITY`: 0 to 2.
//! - `RACESAN_DEDUP`: suppress repeated reports of the same pc pair
//!   (default on).
//!
//! Parsing is loose: unknown values fall back to the default instead of
//! failing startup.

use serde::Serialize;

use crate::shadow::{FIXED_APP_BEG, FIXED_APP_END};

pub const ENV_SHADOW: &str = "RACESAN_SHADOW";
pub const ENV_APP_RANGE: &str = "RACESAN_APP_RANGE";
pub const ENV_HALT_ON_ERROR: &str = "RACESAN_HALT_ON_ERROR";
pub const ENV_VERBOSITY: &str = "RACESAN_VERBOSITY";
pub const ENV_DEDUP: &str = "RACESAN_DEDUP";

pub const MAX_VERBOSITY: u8 = 2;

/// Where the shadow region goes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ShadowMode {
    /// Built-in addresses; startup fails if anything lives there.
    #[default]
    Fixed,
    /// Kernel-chosen base for a `[guard | shadow | guard]` reservation.
    Relocatable,
}

impl ShadowMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "relocatable" | "dynamic" | "auto" | "pie" => Self::Relocatable,
            _ => Self::Fixed,
        }
    }
}

/// All runtime options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub shadow: ShadowMode,
    /// Application window for relocatable mode; `None` means the default
    /// fixed window.
    pub app_range: Option<(usize, usize)>,
    pub halt_on_error: bool,
    pub verbosity: u8,
    pub dedup: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shadow: ShadowMode::Fixed,
            app_range: None,
            halt_on_error: false,
            verbosity: 0,
            dedup: true,
        }
    }
}

impl RuntimeConfig {
    /// Read options from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read options through `lookup`, which maps a variable name to its value.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let shadow = lookup(ENV_SHADOW)
            .map(|v| ShadowMode::from_str_loose(&v))
            .unwrap_or_default();
        let app_range = match shadow {
            ShadowMode::Relocatable => lookup(ENV_APP_RANGE).and_then(|v| parse_range(&v)),
            ShadowMode::Fixed => None,
        };
        Self {
            shadow,
            app_range,
            halt_on_error: lookup(ENV_HALT_ON_ERROR)
                .and_then(|v| parse_bool_loose(&v))
                .unwrap_or(defaults.halt_on_error),
            verbosity: lookup(ENV_VERBOSITY)
                .and_then(|v| v.trim().parse::<u8>().ok())
                .map_or(defaults.verbosity, |v| v.min(MAX_VERBOSITY)),
            dedup: lookup(ENV_DEDUP)
                .and_then(|v| parse_bool_loose(&v))
                .unwrap_or(defaults.dedup),
        }
    }

    /// Relocatable shadow over `[app_beg, app_end)`, other options default.
    #[must_use]
    pub fn relocatable(app_beg: usize, app_end: usize) -> Self {
        Self {
            shadow: ShadowMode::Relocatable,
            app_range: Some((app_beg, app_end)),
            ..Self::default()
        }
    }

    /// Monitored application window.
    #[must_use]
    pub fn app_window(&self) -> (usize, usize) {
        self.app_range.unwrap_or((FIXED_APP_BEG, FIXED_APP_END))
    }
}

fn parse_bool_loose(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_hex(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    usize::from_str_radix(&digits.replace('_', ""), 16).ok()
}

fn parse_range(raw: &str) -> Option<(usize, usize)> {
    let (beg, end) = raw.split_once('-')?;
    let (beg, end) = (parse_hex(beg)?, parse_hex(end)?);
    (beg < end).then_some((beg, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> RuntimeConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        RuntimeConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn parse_shadow_modes() {
        assert_eq!(ShadowMode::from_str_loose("fixed"), ShadowMode::Fixed);
        assert_eq!(ShadowMode::from_str_loose("RELOCATABLE"), ShadowMode::Relocatable);
        assert_eq!(ShadowMode::from_str_loose(" dynamic "), ShadowMode::Relocatable);
        assert_eq!(ShadowMode::from_str_loose("garbage"), ShadowMode::Fixed);
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), RuntimeConfig::default());
        assert_eq!(
            config(&[]).app_window(),
            (FIXED_APP_BEG, FIXED_APP_END)
        );
    }

    #[test]
    fn relocatable_mode_reads_app_range() {
        let cfg = config(&[
            (ENV_SHADOW, "relocatable"),
            (ENV_APP_RANGE, "0x7e0000000000-7e0000100000"),
        ]);
        assert_eq!(cfg.shadow, ShadowMode::Relocatable);
        assert_eq!(cfg.app_window(), (0x7e00_0000_0000, 0x7e00_0010_0000));
    }

    #[test]
    fn app_range_ignored_in_fixed_mode() {
        let cfg = config(&[(ENV_APP_RANGE, "1000-2000")]);
        assert_eq!(cfg.app_range, None);
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = config(&[
            (ENV_SHADOW, "relocatable"),
            (ENV_APP_RANGE, "2000-1000"),
            (ENV_HALT_ON_ERROR, "maybe"),
            (ENV_VERBOSITY, "loud"),
            (ENV_DEDUP, ""),
        ]);
        assert_eq!(cfg.app_range, None);
        assert!(!cfg.halt_on_error);
        assert_eq!(cfg.verbosity, 0);
        assert!(cfg.dedup);
    }

    #[test]
    fn flags_and_verbosity() {
        let cfg = config(&[
            (ENV_HALT_ON_ERROR, "yes"),
            (ENV_VERBOSITY, "9"),
            (ENV_DEDUP, "off"),
        ]);
        assert!(cfg.halt_on_error);
        assert_eq!(cfg.verbosity, MAX_VERBOSITY);
        assert!(!cfg.dedup);
    }
}
