//! Per-family register offset table and hardware limits.
//!
//! Computed exactly once at attach, after variant detection and topology
//! discovery; every later consumer indexes through this table instead of
//! hard-coding offsets. The `REGS_THRU_MW` and split-BAR special cases are
//! resolved here and nowhere else.

use ntb_regs::{soc, xeon, Family, Features};

/// Where the PCIe link-status word lives for a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkStatusSource {
    /// Config-space offset (Xeon).
    Config(u32),
    /// BAR0 MMIO offset (SoC).
    Mmio(u64),
}

/// MMIO/config addresses for one attached device. Immutable after attach.
#[derive(Debug, Clone)]
pub(crate) struct RegisterOffsets {
    /// Local doorbell (write one to clear).
    pub ldb: u64,
    /// Local doorbell mask.
    pub ldb_mask: u64,
    /// Remote doorbell. Ignored when the register-through-window erratum
    /// routes rings through the shadow window instead.
    pub rdb: u64,
    /// BAR 2/3 translation.
    pub bar2_xlat: u64,
    /// BAR 4/5 translation.
    pub bar4_xlat: u64,
    /// BAR 5 translation (split-BAR mode only).
    pub bar5_xlat: Option<u64>,
    /// Local scratchpads.
    pub spad_local: u64,
    /// Remote scratchpads. Ignored under the register-through-window erratum.
    pub spad_remote: u64,
    /// NTB link control.
    pub lnk_cntl: u64,
    /// Negotiated link status.
    pub lnk_stat: LinkStatusSource,
    /// Shadowed secondary PCI command register.
    pub spci_cmd: u64,
}

/// Hardware limits for one attached device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    /// Usable memory windows (after erratum reservations).
    pub max_mw: u8,
    /// Scratchpad registers.
    pub max_spads: u8,
    /// Doorbell bits available to software.
    pub max_db_bits: u8,
    /// MSI-X vectors the family exposes.
    pub msix_cnt: u8,
}

/// Doorbell bits serviced per vector for a family.
pub(crate) const fn bits_per_vector(family: Family) -> u8 {
    match family {
        Family::Xeon => xeon::DB_BITS_PER_VEC,
        Family::Soc => soc::DB_BITS_PER_VEC,
    }
}

impl RegisterOffsets {
    pub(crate) fn compute(family: Family, features: Features) -> Self {
        match family {
            Family::Xeon => Self {
                ldb: xeon::PDOORBELL_OFFSET,
                ldb_mask: xeon::PDBMSK_OFFSET,
                rdb: xeon::B2B_DOORBELL_OFFSET,
                bar2_xlat: xeon::SBAR2XLAT_OFFSET,
                bar4_xlat: xeon::SBAR4XLAT_OFFSET,
                bar5_xlat: features
                    .has(Features::SPLIT_BAR)
                    .then_some(xeon::SBAR5XLAT_OFFSET),
                spad_local: xeon::SPAD_OFFSET,
                spad_remote: xeon::B2B_SPAD_OFFSET,
                lnk_cntl: xeon::NTBCNTL_OFFSET,
                lnk_stat: LinkStatusSource::Config(xeon::LINK_STATUS_OFFSET),
                spci_cmd: xeon::SPCICMD_OFFSET,
            },
            Family::Soc => Self {
                ldb: soc::PDOORBELL_OFFSET,
                ldb_mask: soc::PDBMSK_OFFSET,
                rdb: soc::B2B_DOORBELL_OFFSET,
                bar2_xlat: soc::SBAR2XLAT_OFFSET,
                bar4_xlat: soc::SBAR4XLAT_OFFSET,
                bar5_xlat: None,
                spad_local: soc::SPAD_OFFSET,
                spad_remote: soc::B2B_SPAD_OFFSET,
                lnk_cntl: soc::NTBCNTL_OFFSET,
                lnk_stat: LinkStatusSource::Mmio(soc::LINK_STATUS_OFFSET),
                spci_cmd: soc::SPCICMD_OFFSET,
            },
        }
    }
}

impl Limits {
    pub(crate) fn compute(family: Family, features: Features) -> Self {
        match family {
            Family::Xeon => {
                let mut max_mw = if features.has(Features::SPLIT_BAR) {
                    xeon::HSXSPLIT_MAX_MW
                } else {
                    xeon::SNB_MAX_MW
                };
                // The last window proxies remote register access under the
                // through-window erratum and is lost to the transport.
                if features.has(Features::REGS_THRU_MW) {
                    max_mw -= 1;
                }
                let mut max_db_bits = xeon::MAX_DB_BITS;
                // Bit 14 of the B2B doorbell is not mirrored to the remote
                // side; shrink by one unless rings bypass that register.
                if features.has(Features::B2BDOORBELL_BIT14)
                    && !features.has(Features::REGS_THRU_MW)
                {
                    max_db_bits -= 1;
                }
                Self {
                    max_mw,
                    max_spads: xeon::MAX_SPADS,
                    max_db_bits,
                    msix_cnt: xeon::MSIX_CNT,
                }
            }
            Family::Soc => Self {
                max_mw: soc::MAX_MW,
                max_spads: soc::MAX_SPADS,
                max_db_bits: soc::MAX_DB_BITS,
                msix_cnt: soc::MSIX_CNT,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soc_offsets() {
        let regs = RegisterOffsets::compute(Family::Soc, Features(0));
        assert_eq!(regs.ldb, soc::PDOORBELL_OFFSET);
        assert_eq!(regs.rdb, soc::B2B_DOORBELL_OFFSET);
        assert_eq!(regs.bar5_xlat, None);
        assert_eq!(
            regs.lnk_stat,
            LinkStatusSource::Mmio(soc::LINK_STATUS_OFFSET)
        );
    }

    #[test]
    fn xeon_split_bar_selects_bar5_xlat() {
        let plain = RegisterOffsets::compute(Family::Xeon, Features(0));
        assert_eq!(plain.bar5_xlat, None);
        let split = RegisterOffsets::compute(Family::Xeon, Features::SPLIT_BAR);
        assert_eq!(split.bar5_xlat, Some(xeon::SBAR5XLAT_OFFSET));
    }

    #[test]
    fn thru_mw_erratum_reserves_a_window() {
        let limits = Limits::compute(Family::Xeon, Features::REGS_THRU_MW);
        assert_eq!(limits.max_mw, xeon::SNB_MAX_MW - 1);
        let split = Limits::compute(
            Family::Xeon,
            Features::REGS_THRU_MW.with(Features::SPLIT_BAR),
        );
        assert_eq!(split.max_mw, xeon::HSXSPLIT_MAX_MW - 1);
    }

    #[test]
    fn doorbell_bit14_erratum_only_without_shadow_path() {
        let shadowed = Limits::compute(
            Family::Xeon,
            Features::B2BDOORBELL_BIT14.with(Features::REGS_THRU_MW),
        );
        assert_eq!(shadowed.max_db_bits, xeon::MAX_DB_BITS);
        let direct = Limits::compute(Family::Xeon, Features::B2BDOORBELL_BIT14);
        assert_eq!(direct.max_db_bits, xeon::MAX_DB_BITS - 1);
    }

    #[test]
    fn soc_limits() {
        let limits = Limits::compute(Family::Soc, Features(0));
        assert_eq!(limits.max_mw, 2);
        assert_eq!(limits.max_db_bits, 34);
        assert_eq!(bits_per_vector(Family::Soc), 1);
    }
}
