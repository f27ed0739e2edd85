//! Xeon NTB register map.
//!
//! All `*_OFFSET` constants are byte offsets into BAR0 (the register
//! aperture) unless the name says config space. The doorbell and doorbell
//! mask registers are 16 bits wide on this family.

// ── Primary-side limit and translation registers ─────────────────────────────

/// Primary BAR 2/3 limit.
pub const PBAR23LMT_OFFSET: u64 = 0x0000;
/// Primary BAR 4/5 limit (whole register).
pub const PBAR45LMT_OFFSET: u64 = 0x0008;
/// Primary BAR 4 limit (low half in split-BAR mode).
pub const PBAR4LMT_OFFSET: u64 = 0x0008;
/// Primary BAR 5 limit (high half in split-BAR mode).
pub const PBAR5LMT_OFFSET: u64 = 0x000C;
/// Primary BAR 2/3 translation.
pub const PBAR2XLAT_OFFSET: u64 = 0x0010;
/// Primary BAR 4/5 translation (whole register).
pub const PBAR4XLAT_OFFSET: u64 = 0x0018;
/// Primary BAR 5 translation (split-BAR mode).
pub const PBAR5XLAT_OFFSET: u64 = 0x001C;

// ── Secondary-side registers ─────────────────────────────────────────────────

/// Secondary BAR 2/3 limit.
pub const SBAR23LMT_OFFSET: u64 = 0x0020;
/// Secondary BAR 4/5 limit.
pub const SBAR45LMT_OFFSET: u64 = 0x0028;
/// Secondary BAR 2/3 translation.
pub const SBAR2XLAT_OFFSET: u64 = 0x0030;
/// Secondary BAR 4/5 translation (whole register).
pub const SBAR4XLAT_OFFSET: u64 = 0x0038;
/// Secondary BAR 5 translation (split-BAR mode).
pub const SBAR5XLAT_OFFSET: u64 = 0x003C;
/// Secondary BAR 0/1 base address.
pub const SBAR0BASE_OFFSET: u64 = 0x0040;
/// Secondary BAR 2/3 base address.
pub const SBAR2BASE_OFFSET: u64 = 0x0048;
/// Secondary BAR 4/5 base address (whole register).
pub const SBAR4BASE_OFFSET: u64 = 0x0050;
/// Secondary BAR 5 base address (split-BAR mode).
pub const SBAR5BASE_OFFSET: u64 = 0x0054;

// ── Control, doorbells, scratchpads ──────────────────────────────────────────

/// NTB control register.
pub const NTBCNTL_OFFSET: u64 = 0x0058;
/// Primary doorbell (16-bit, write one to clear).
pub const PDOORBELL_OFFSET: u64 = 0x0060;
/// Primary doorbell mask (16-bit).
pub const PDBMSK_OFFSET: u64 = 0x0062;
/// Secondary doorbell. Subject to the SDOORBELL lockup erratum.
pub const SDOORBELL_OFFSET: u64 = 0x0064;
/// Secondary doorbell mask.
pub const SDBMSK_OFFSET: u64 = 0x0066;
/// Scratchpad registers (16 × 32-bit).
pub const SPAD_OFFSET: u64 = 0x0080;
/// B2B scratchpad window.
pub const B2B_SPAD_OFFSET: u64 = 0x0100;
/// B2B doorbell window.
pub const B2B_DOORBELL_OFFSET: u64 = 0x0140;
/// B2B translation, low 32 bits (64-bit register writable only in halves).
pub const B2B_XLAT_OFFSET_LOW: u64 = 0x0144;
/// B2B translation, high 32 bits.
pub const B2B_XLAT_OFFSET_HIGH: u64 = 0x0148;

/// Shadowed secondary PCI command register, reachable through BAR0.
pub const SPCICMD_OFFSET: u64 = 0x0504;

// ── Register-through-window shadow offsets ───────────────────────────────────
// Under the REGS_THRU_MW erratum the last memory window maps the peer's
// register aperture, so remote registers appear at their primary offsets.

/// Peer doorbell as seen through the shadow memory window.
pub const SHADOW_PDOORBELL_OFFSET: u64 = 0x0060;
/// Peer scratchpads as seen through the shadow memory window.
pub const SHADOW_SPAD_OFFSET: u64 = 0x0080;

// ── Config space ─────────────────────────────────────────────────────────────

/// True BAR 2/3 size in bits, config space (BAR-size misreport erratum).
pub const PBAR23SZ_OFFSET: u32 = 0x00D0;
/// True BAR 4/5 size in bits, config space.
pub const PBAR45SZ_OFFSET: u32 = 0x00D1;
/// PCIe link status, config space.
pub const LINK_STATUS_OFFSET: u32 = 0x01A2;

// ── PPD fields ───────────────────────────────────────────────────────────────

/// Connection-type field mask.
pub const PPD_CONN_TYPE: u8 = 0x03;
/// Device-type bit: set means upstream of the crosslink.
pub const PPD_DEV_TYPE: u8 = 0x10;
/// Split-BAR mode bit.
pub const PPD_SPLIT_BAR: u8 = 0x40;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Scratchpad register count.
pub const MAX_SPADS: u8 = 16;
/// Doorbell bits available to software (bit 15 is the link bit).
pub const MAX_DB_BITS: u8 = 15;
/// MSI-X vectors this family exposes.
pub const MSIX_CNT: u8 = 4;
/// Doorbell bits serviced by each of the data vectors.
pub const DB_BITS_PER_VEC: u8 = 5;
/// Doorbell bit position of the hardware link event.
pub const LINK_DB: u8 = 15;
/// Doorbell-register mask of the hardware link bit.
pub const DB_HW_LINK: u64 = 1 << LINK_DB;

/// Memory windows without split-BAR mode.
pub const SNB_MAX_MW: u8 = 2;
/// Memory windows with BAR 4/5 split into two 32-bit windows.
pub const HSXSPLIT_MAX_MW: u8 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_block_is_contiguous() {
        assert_eq!(PDBMSK_OFFSET, PDOORBELL_OFFSET + 2);
        assert_eq!(SDOORBELL_OFFSET, PDOORBELL_OFFSET + 4);
    }

    #[test]
    fn shadow_offsets_mirror_primary() {
        assert_eq!(SHADOW_PDOORBELL_OFFSET, PDOORBELL_OFFSET);
        assert_eq!(SHADOW_SPAD_OFFSET, SPAD_OFFSET);
    }

    #[test]
    fn vector_layout_covers_all_doorbells() {
        // 3 data vectors x 5 bits, then the link vector.
        assert_eq!(u32::from(DB_BITS_PER_VEC) * (u32::from(MSIX_CNT) - 1), 15);
        assert_eq!(LINK_DB, MAX_DB_BITS);
    }
}
