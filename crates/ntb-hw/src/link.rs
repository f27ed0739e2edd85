//! Link state machine: up/down tracking, heartbeat polling, and the
//! forced-detect recovery sequence.
//!
//! Xeon raises a hardware link interrupt, delivered through the reserved
//! vector; the SoC family has none, so a heartbeat timer polls link
//! status. When the heartbeat finds the link held in forced-detect, the
//! recovery timer takes over: it toggles the ModPhy lanes, clears the
//! accumulated PHY error state, releases the forced-detect hold, and
//! re-checks after a jittered delay until the negotiated width and speed
//! match the last known-good values. The jitter keeps two peers from
//! retrying in lockstep forever.

use std::sync::Arc;
use std::time::Duration;

use ntb_regs::{link as lnk, soc, xeon, Family, Features};
use tracing::{debug, info, warn};

use crate::device::DeviceInner;
use crate::regmap::LinkStatusSource;

/// Physical link state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    /// No link to the peer.
    #[default]
    Down,
    /// Link trained and active.
    Up,
}

/// Event delivered to the registered transport callback on a real link
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link came up.
    Up,
    /// The link went down.
    Down,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum RecoveryPhase {
    /// Next firing performs the register-level restart sequence.
    #[default]
    Restart,
    /// Next firing checks whether the link came back.
    Check,
}

/// Authoritative link state. Written only through [`observe`].
#[derive(Debug, Default)]
pub(crate) struct LinkInner {
    pub(crate) state: LinkState,
    /// Last known-good negotiated width; kept across link-down so
    /// recovery can compare against it.
    pub(crate) width: u8,
    /// Last known-good negotiated speed.
    pub(crate) speed: u8,
    pub(crate) phase: RecoveryPhase,
}

/// Create and arm the polling timers. Only the SoC family polls; Xeon
/// link events arrive on the reserved interrupt vector.
pub(crate) fn start_timers(inner: &Arc<DeviceInner>) {
    if inner.family != Family::Soc {
        return;
    }
    let weak = Arc::downgrade(inner);
    let heartbeat = inner.wheel.callout(move || {
        if let Some(inner) = weak.upgrade() {
            heartbeat_fire(&inner);
        }
    });
    let weak = Arc::downgrade(inner);
    let recovery = inner.wheel.callout(move || {
        if let Some(inner) = weak.upgrade() {
            recovery_fire(&inner);
        }
    });
    let _ = inner.heartbeat.set(heartbeat);
    let _ = inner.recovery.set(recovery);
    if let Some(heartbeat) = inner.heartbeat.get() {
        heartbeat.reset(Duration::ZERO);
    }
}

/// Read the link state from hardware and feed it to [`observe`].
pub(crate) fn check_link_status(inner: &Arc<DeviceInner>) {
    let state = match inner.family {
        Family::Soc => {
            let cntl = inner.reg_read32(inner.regs.lnk_cntl);
            if cntl & soc::CNTL_LINK_DOWN != 0 {
                LinkState::Down
            } else {
                LinkState::Up
            }
        }
        Family::Xeon => {
            let status = inner.bus.config_read16(xeon::LINK_STATUS_OFFSET);
            if status & lnk::STATUS_ACTIVE != 0 {
                LinkState::Up
            } else {
                LinkState::Down
            }
        }
    };
    observe(inner, state);
}

/// Sole writer of the authoritative link state. Suppresses duplicate
/// transitions; records negotiated width/speed on the way up and leaves
/// them untouched on the way down (recovery compares against them).
pub(crate) fn observe(inner: &Arc<DeviceInner>, new_state: LinkState) {
    let event = {
        let mut link = inner.link.lock().unwrap();
        if link.state == new_state {
            return;
        }
        link.state = new_state;
        match new_state {
            LinkState::Up => {
                let status = read_link_status_raw(inner);
                link.width = lnk::link_width(status);
                link.speed = lnk::link_speed(status);
                info!(width = link.width, speed = link.speed, "link up");
                LinkEvent::Up
            }
            LinkState::Down => {
                info!("link down");
                LinkEvent::Down
            }
        }
    };

    if event == LinkEvent::Up && inner.family == Family::Soc {
        if let Some(heartbeat) = inner.heartbeat.get() {
            heartbeat.reset(inner.tunables.heartbeat_interval);
        }
    }

    let callback = inner.event_cb.lock().unwrap().clone();
    if let Some(callback) = callback {
        (*callback)(event);
    }
}

fn read_link_status_raw(inner: &DeviceInner) -> u16 {
    match inner.regs.lnk_stat {
        LinkStatusSource::Config(offset) => inner.bus.config_read16(offset),
        LinkStatusSource::Mmio(offset) => inner.reg_read16(offset),
    }
}

/// Periodic link poll for the family without a link interrupt. Hands off
/// to the recovery timer when the link is down with the forced-detect
/// hold asserted.
fn heartbeat_fire(inner: &Arc<DeviceInner>) {
    if inner.is_detached() {
        return;
    }
    check_link_status(inner);

    if inner.link.lock().unwrap().state == LinkState::Down {
        let status = inner.reg_read32(soc::LTSSMSTATEJMP_OFFSET);
        if status & soc::LTSSMSTATEJMP_FORCEDETECT != 0 {
            warn!("link held in forced-detect, starting recovery");
            inner.link.lock().unwrap().phase = RecoveryPhase::Restart;
            if let Some(recovery) = inner.recovery.get() {
                recovery.reset(Duration::ZERO);
            }
            return;
        }
    }

    if let Some(heartbeat) = inner.heartbeat.get() {
        heartbeat.reset(inner.tunables.heartbeat_interval);
    }
}

/// Recovery timer. Alternates between the restart sequence and a
/// completion check; there is no retry ceiling.
fn recovery_fire(inner: &Arc<DeviceInner>) {
    if inner.is_detached() {
        return;
    }
    let phase = inner.link.lock().unwrap().phase;
    match phase {
        RecoveryPhase::Restart => {
            perform_link_restart(inner);
            inner.link.lock().unwrap().phase = RecoveryPhase::Check;
            // The two ends of the link recover independently; identical
            // retry timing would keep them colliding, so the check is
            // delayed by the base interval plus a random offset.
            if let Some(recovery) = inner.recovery.get() {
                recovery.reset(jittered(inner.tunables.recovery_base));
            }
        }
        RecoveryPhase::Check => {
            if recovery_incomplete(inner) {
                debug!("link recovery incomplete, retrying");
                inner.link.lock().unwrap().phase = RecoveryPhase::Restart;
                if let Some(recovery) = inner.recovery.get() {
                    recovery.reset(inner.tunables.heartbeat_interval);
                }
            } else {
                info!("link recovery complete");
                if let Some(heartbeat) = inner.heartbeat.get() {
                    heartbeat.reset(inner.tunables.heartbeat_interval);
                }
            }
        }
    }
}

/// The register-level restart sequence, as the hardware people specified
/// it: reset the ModPhy lanes, wait for them to settle, clear the
/// accumulated error state, then release the hold that blocks retraining.
fn perform_link_restart(inner: &Arc<DeviceInner>) {
    // Reset the NTB ModPhy lanes.
    inner.reg_write8(soc::MODPHY_PCSREG6, 0xE0);
    inner.reg_write8(soc::MODPHY_PCSREG4, 0x40);
    inner.reg_write8(soc::MODPHY_PCSREG4, 0x60);
    inner.reg_write8(soc::MODPHY_PCSREG6, 0x60);

    // Let the ModPhy settle.
    std::thread::sleep(inner.tunables.settle_pause);

    // Clear AER replay-rollover status, write one to clear.
    let status = inner.reg_read32(soc::ERRCORSTS_OFFSET);
    inner.reg_write32(
        soc::ERRCORSTS_OFFSET,
        status & ntb_regs::pci::AER_COR_REPLAY_ROLLOVER,
    );

    // Clear unexpected electrical idle in the LTSSM, write one to clear.
    let status = inner.reg_read32(soc::LTSSMERRSTS0_OFFSET);
    inner.reg_write32(
        soc::LTSSMERRSTS0_OFFSET,
        status | soc::LTSSMERRSTS0_UNEXPECTEDEI,
    );

    // Clear deskew buffer error, write one to clear.
    let status = inner.reg_read32(soc::DESKEWSTS_OFFSET);
    inner.reg_write32(soc::DESKEWSTS_OFFSET, status | soc::DESKEWSTS_DBERR);

    // Clear elastic buffer overflow.
    let status = inner.reg_read32(soc::IBSTERRRCRVSTS0_OFFSET);
    inner.reg_write32(soc::IBSTERRRCRVSTS0_OFFSET, status & soc::IBIST_ERR_OFLOW);

    // Release the state machine so the link can retrain.
    let status = inner.reg_read32(soc::LTSSMSTATEJMP_OFFSET);
    inner.reg_write32(
        soc::LTSSMSTATEJMP_OFFSET,
        status & !soc::LTSSMSTATEJMP_FORCEDETECT,
    );
}

fn recovery_incomplete(inner: &Arc<DeviceInner>) -> bool {
    let status = inner.reg_read32(soc::LTSSMSTATEJMP_OFFSET);
    if status & soc::LTSSMSTATEJMP_FORCEDETECT != 0 {
        return true;
    }

    let status = inner.reg_read32(soc::IBSTERRRCRVSTS0_OFFSET);
    if status & soc::IBIST_ERR_OFLOW != 0 {
        return true;
    }

    let cntl = inner.reg_read32(inner.regs.lnk_cntl);
    if cntl & soc::CNTL_LINK_DOWN != 0 {
        return true;
    }

    let status = read_link_status_raw(inner);
    let link = inner.link.lock().unwrap();
    link.width != lnk::link_width(status) || link.speed != lnk::link_speed(status)
}

/// Enable link training on the Xeon NTB control register.
pub(crate) fn hw_link_up(inner: &Arc<DeviceInner>) {
    let mut cntl = inner.reg_read32(inner.regs.lnk_cntl);
    cntl &= !(lnk::CNTL_LINK_DISABLE | lnk::CNTL_CFG_LOCK);
    cntl |= lnk::CNTL_P2S_BAR23_SNOOP | lnk::CNTL_S2P_BAR23_SNOOP;
    cntl |= lnk::CNTL_P2S_BAR4_SNOOP | lnk::CNTL_S2P_BAR4_SNOOP;
    if inner.features.has(Features::SPLIT_BAR) {
        cntl |= lnk::CNTL_P2S_BAR5_SNOOP | lnk::CNTL_S2P_BAR5_SNOOP;
    }
    inner.reg_write32(inner.regs.lnk_cntl, cntl);
}

/// Disable link training and lock the secondary config space.
pub(crate) fn hw_link_down(inner: &Arc<DeviceInner>) {
    let mut cntl = inner.reg_read32(inner.regs.lnk_cntl);
    cntl &= !(lnk::CNTL_P2S_BAR23_SNOOP | lnk::CNTL_S2P_BAR23_SNOOP);
    cntl &= !(lnk::CNTL_P2S_BAR4_SNOOP | lnk::CNTL_S2P_BAR4_SNOOP);
    if inner.features.has(Features::SPLIT_BAR) {
        cntl &= !(lnk::CNTL_P2S_BAR5_SNOOP | lnk::CNTL_S2P_BAR5_SNOOP);
    }
    cntl |= lnk::CNTL_LINK_DISABLE | lnk::CNTL_CFG_LOCK;
    inner.reg_write32(inner.regs.lnk_cntl, cntl);
}

/// Base delay plus a uniform random offset in `[0, base)`.
fn jittered(base: Duration) -> Duration {
    #[allow(clippy::cast_possible_truncation)]
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    base + Duration::from_millis(u64::from(random_u32()) % base_ms)
}

fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    match rustix::rand::getrandom(&mut buf, rustix::rand::GetRandomFlags::empty()) {
        Ok(_) => u32::from_ne_bytes(buf),
        // A failed entropy read costs only the collision avoidance.
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_bounded_uniform_offset() {
        let base = Duration::from_millis(500);
        for _ in 0..256 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d < base * 2);
        }
    }

    #[test]
    fn jitter_varies_between_draws() {
        let base = Duration::from_millis(500);
        let draws: Vec<Duration> = (0..32).map(|_| jittered(base)).collect();
        let first = draws[0];
        assert!(
            draws.iter().any(|d| *d != first),
            "32 identical jitter draws"
        );
    }

    #[test]
    fn zero_base_stays_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
