//! Driver tunables.
//!
//! The two interrupt-policy knobs are administrative switches, not
//! correctness knobs; the timing intervals default to the
//! hardware-mandated values and exist as fields so tests can shorten
//! them.

use std::time::Duration;

/// Policy and timing knobs, fixed for the lifetime of one attach.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Force MSI-X messages to be remapped onto fewer vectors even when
    /// the desired number is available. Exercises the remap path.
    pub force_remap: bool,
    /// Prefer a single legacy interrupt line over remapping MSI-X
    /// messages onto fewer vectors.
    pub prefer_legacy: bool,
    /// Link heartbeat poll interval (families without a link interrupt).
    pub heartbeat_interval: Duration,
    /// Base delay between link-recovery attempts; the actual delay adds a
    /// uniform random offset in `[0, recovery_base)`.
    pub recovery_base: Duration,
    /// Settling pause after toggling the ModPhy lanes.
    pub settle_pause: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            force_remap: false,
            prefer_legacy: false,
            heartbeat_interval: Duration::from_secs(1),
            recovery_base: Duration::from_millis(500),
            settle_pause: Duration::from_millis(100),
        }
    }
}

impl Tunables {
    /// Build tunables from the environment.
    ///
    /// `NTB_HW_FORCE_REMAP` and `NTB_HW_PREFER_LEGACY` accept `1` or
    /// `true`; anything else (or absence) leaves the default.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            force_remap: env_flag("NTB_HW_FORCE_REMAP"),
            prefer_legacy: env_flag("NTB_HW_PREFER_LEGACY"),
            ..Self::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware_timings() {
        let t = Tunables::default();
        assert_eq!(t.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(t.recovery_base, Duration::from_millis(500));
        assert!(!t.force_remap);
        assert!(!t.prefer_legacy);
    }
}
