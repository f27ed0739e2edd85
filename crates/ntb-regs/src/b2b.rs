//! Back-to-back peer aperture addresses.
//!
//! In a B2B topology each side claims a fixed slice of the peer's address
//! space for its apertures; which set gets programmed depends on whether
//! the port sits upstream or downstream of the crosslink. The low nibble
//! carries the BAR attribute bits (64-bit, prefetchable) because these
//! values are written directly into base-address registers.

/// Upstream BAR 0/1 aperture.
pub const MBAR01_USD_ADDR: u64 = 0x0000_0021_0000_000C;
/// Upstream BAR 2/3 aperture.
pub const MBAR23_USD_ADDR: u64 = 0x0000_0041_0000_000C;
/// Upstream BAR 4 aperture.
pub const MBAR4_USD_ADDR: u64 = 0x0000_0081_0000_000C;
/// Upstream BAR 5 aperture (split-BAR mode).
pub const MBAR5_USD_ADDR: u64 = 0x0000_00A1_0000_000C;
/// Downstream BAR 0/1 aperture.
pub const MBAR01_DSD_ADDR: u64 = 0x0000_0020_0000_000C;
/// Downstream BAR 2/3 aperture.
pub const MBAR23_DSD_ADDR: u64 = 0x0000_0040_0000_000C;
/// Downstream BAR 4 aperture.
pub const MBAR4_DSD_ADDR: u64 = 0x0000_0080_0000_000C;
/// Downstream BAR 5 aperture (split-BAR mode).
pub const MBAR5_DSD_ADDR: u64 = 0x0000_00A0_0000_000C;
