//! Atom SoC NTB register map.
//!
//! Byte offsets into BAR0 unless the name says config space. The doorbell
//! and doorbell mask registers are 64 bits wide on this family, and there
//! is no hardware link interrupt — link state is polled.

// ── Primary-side registers ───────────────────────────────────────────────────

/// Secondary BAR 2/3 translation.
pub const SBAR2XLAT_OFFSET: u64 = 0x0008;
/// Secondary BAR 4/5 translation.
pub const SBAR4XLAT_OFFSET: u64 = 0x0010;
/// Primary doorbell (64-bit, write one to clear).
pub const PDOORBELL_OFFSET: u64 = 0x0020;
/// Primary doorbell mask (64-bit).
pub const PDBMSK_OFFSET: u64 = 0x0028;
/// NTB control register.
pub const NTBCNTL_OFFSET: u64 = 0x0060;
/// Scratchpad registers (16 × 32-bit).
pub const SPAD_OFFSET: u64 = 0x0080;

// ── B2B (peer-facing) registers ──────────────────────────────────────────────

/// Primary BAR 2/3 translation, peer block.
pub const PBAR2XLAT_OFFSET: u64 = 0x8008;
/// Primary BAR 4/5 translation, peer block.
pub const PBAR4XLAT_OFFSET: u64 = 0x8010;
/// Peer doorbell.
pub const B2B_DOORBELL_OFFSET: u64 = 0x8020;
/// Peer scratchpads.
pub const B2B_SPAD_OFFSET: u64 = 0x8080;

// ── ModPhy analog lane registers ─────────────────────────────────────────────

/// ModPhy PCS lane register 4.
pub const MODPHY_PCSREG4: u64 = 0x1_C004;
/// ModPhy PCS lane register 6.
pub const MODPHY_PCSREG6: u64 = 0x1_C006;

// ── PCIe IP block ────────────────────────────────────────────────────────────

const IP_BASE: u64 = 0xC000;

/// Deskew buffer status.
pub const DESKEWSTS_OFFSET: u64 = IP_BASE + 0x3024;
/// LTSSM state-jump control/status.
pub const LTSSMSTATEJMP_OFFSET: u64 = IP_BASE + 0x3040;
/// LTSSM error status 0.
pub const LTSSMERRSTS0_OFFSET: u64 = IP_BASE + 0x3180;
/// IBIST error-recovery status 0.
pub const IBSTERRRCRVSTS0_OFFSET: u64 = IP_BASE + 0x3324;

/// Deskew buffer error (write one to clear).
pub const DESKEWSTS_DBERR: u32 = 1 << 15;
/// Unexpected electrical idle (write one to clear).
pub const LTSSMERRSTS0_UNEXPECTEDEI: u32 = 1 << 20;
/// Hardware is holding the link in forced-detect; retraining is blocked
/// until this bit is cleared.
pub const LTSSMSTATEJMP_FORCEDETECT: u32 = 1 << 29;
/// Elastic/IBIST buffer overflow error bits.
pub const IBIST_ERR_OFLOW: u32 = 0x7FFF_7FFF;

// ── Shadowed peer config block ───────────────────────────────────────────────

/// Shadowed secondary PCI command register.
pub const SPCICMD_OFFSET: u64 = 0xB004;
/// Secondary BAR 2/3 base address.
pub const SBAR2BASE_OFFSET: u64 = 0xB018;
/// Secondary BAR 4/5 base address.
pub const SBAR4BASE_OFFSET: u64 = 0xB020;
/// PCIe link status (MMIO-shadowed on this family).
pub const LINK_STATUS_OFFSET: u64 = 0xB052;
/// AER correctable-error status.
pub const ERRCORSTS_OFFSET: u64 = 0xB110;

// ── NTB control bits ─────────────────────────────────────────────────────────

/// Link-down status bit in the NTB control register.
pub const CNTL_LINK_DOWN: u32 = 1 << 16;

// ── PPD fields ───────────────────────────────────────────────────────────────

/// Write to initiate PCIe link training.
pub const PPD_INIT_LINK: u32 = 0x0008;
/// Connection-type field mask (bits 9:8).
pub const PPD_CONN_TYPE: u32 = 0x0300;
/// Device-type bit: set means downstream of the crosslink.
pub const PPD_DEV_TYPE: u32 = 0x1000;

// ── Early-silicon erratum ────────────────────────────────────────────────────

/// Config register masking transaction-layer internal parity errors.
pub const PARITY_ERRATUM_OFFSET: u32 = 0x00FC;
/// Value masking the parity errors on early silicon.
pub const PARITY_ERRATUM_VALUE: u32 = 0x0000_0004;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Scratchpad register count.
pub const MAX_SPADS: u8 = 16;
/// Doorbell bits.
pub const MAX_DB_BITS: u8 = 34;
/// MSI-X vectors this family exposes (one per doorbell bit).
pub const MSIX_CNT: u8 = 34;
/// Doorbell bits serviced by each vector.
pub const DB_BITS_PER_VEC: u8 = 1;
/// Memory windows.
pub const MAX_MW: u8 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_block_registers_sit_above_base() {
        assert_eq!(LTSSMSTATEJMP_OFFSET, 0xF040);
        assert_eq!(DESKEWSTS_OFFSET, 0xF024);
        assert_eq!(IBSTERRRCRVSTS0_OFFSET, 0xF324);
    }

    #[test]
    fn one_vector_per_doorbell() {
        assert_eq!(MAX_DB_BITS, MSIX_CNT);
        assert_eq!(DB_BITS_PER_VEC, 1);
    }
}
