//! PCI identifiers, hardware families, and feature/erratum bits.

use crate::pci::devid;

/// Intel vendor ID (PCI-SIG assigned).
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Device IDs for the supported NTB parts.
pub mod device_id {
    /// Atom Processor S1200 NTB, primary side, back-to-back.
    pub const SOC_S1200: u16 = 0x0C4E;
    /// JSF Xeon C35xx/C55xx NTB, back-to-back.
    pub const XEON_JSF: u16 = 0x3725;
    /// SNB Xeon E5/Core i7 NTB, back-to-back.
    pub const XEON_SNB: u16 = 0x3C0D;
    /// IVT Xeon E5 V2 NTB, back-to-back.
    pub const XEON_IVT: u16 = 0x0E0D;
    /// HSX Xeon E5 V3 NTB, back-to-back.
    pub const XEON_HSX: u16 = 0x2F0D;
    /// BDX Xeon E5 V4 NTB, back-to-back.
    pub const XEON_BDX: u16 = 0x6F0D;
}

/// The two NTB hardware families.
///
/// Family selects the register map, doorbell width (16-bit on Xeon, 64-bit
/// on SoC), interrupt layout, and link-event mechanism (Xeon has a link
/// interrupt; SoC is polled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Xeon server parts (JSF/SNB/IVT/HSX/BDX).
    Xeon,
    /// Atom S1200 SoC parts.
    Soc,
}

/// Erratum and feature bits for a detected part.
///
/// Hardware owns the low 32 bits; software/configuration owns the top 32
/// (split-BAR mode is discovered from the PPD register, not the ID table).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features(pub u64);

impl Features {
    /// BAR sizes are misreported by the hardware; the true size must be
    /// read from the `PBAR*SZ` vendor config registers.
    pub const BAR_SIZE_4K: Features = Features(1 << 0);
    /// Remote registers must be accessed through a memory window; writes to
    /// the secondary/B2B doorbell MMIO can hang the system.
    pub const REGS_THRU_MW: Features = Features(1 << 1);
    /// Inbound access to the first secondary BAR pair can lock up the part.
    pub const SB01BASE_LOCKUP: Features = Features(1 << 2);
    /// Bit 14 of the B2B doorbell is not mirrored to the remote system.
    pub const B2BDOORBELL_BIT14: Features = Features(1 << 3);
    /// BARs 4/5 operate as two independent 32-bit windows.
    pub const SPLIT_BAR: Features = Features(1 << 32);

    /// True if every bit of `other` is present.
    #[must_use]
    pub const fn has(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two feature sets.
    #[must_use]
    pub const fn with(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }
}

/// One row of the supported-device table.
#[derive(Debug, Clone, Copy)]
pub struct HwInfo {
    /// Combined `(device << 16) | vendor` identifier.
    pub device_id: u32,
    /// Human-readable part name.
    pub desc: &'static str,
    /// Hardware family.
    pub family: Family,
    /// Erratum/feature bits known for this part.
    pub features: Features,
}

const XEON_ERRATA: Features =
    Features(Features::REGS_THRU_MW.0 | Features::B2BDOORBELL_BIT14.0);
const XEON_ERRATA_LOCKUP: Features = Features(XEON_ERRATA.0 | Features::SB01BASE_LOCKUP.0);

/// Supported NTB parts.
pub const DEVICE_TABLE: &[HwInfo] = &[
    HwInfo {
        device_id: devid(INTEL_VENDOR_ID, device_id::SOC_S1200),
        desc: "Atom Processor S1200 NTB Primary B2B",
        family: Family::Soc,
        features: Features(0),
    },
    HwInfo {
        device_id: devid(INTEL_VENDOR_ID, device_id::XEON_JSF),
        desc: "JSF Xeon C35xx/C55xx Non-Transparent Bridge B2B",
        family: Family::Xeon,
        features: XEON_ERRATA,
    },
    HwInfo {
        device_id: devid(INTEL_VENDOR_ID, device_id::XEON_SNB),
        desc: "SNB Xeon E5/Core i7 Non-Transparent Bridge B2B",
        family: Family::Xeon,
        features: XEON_ERRATA,
    },
    HwInfo {
        device_id: devid(INTEL_VENDOR_ID, device_id::XEON_IVT),
        desc: "IVT Xeon E5 V2 Non-Transparent Bridge B2B",
        family: Family::Xeon,
        features: Features(XEON_ERRATA_LOCKUP.0 | Features::BAR_SIZE_4K.0),
    },
    HwInfo {
        device_id: devid(INTEL_VENDOR_ID, device_id::XEON_HSX),
        desc: "HSX Xeon E5 V3 Non-Transparent Bridge B2B",
        family: Family::Xeon,
        features: XEON_ERRATA_LOCKUP,
    },
    HwInfo {
        device_id: devid(INTEL_VENDOR_ID, device_id::XEON_BDX),
        desc: "BDX Xeon E5 V4 Non-Transparent Bridge B2B",
        family: Family::Xeon,
        features: XEON_ERRATA_LOCKUP,
    },
];

/// Look up a combined device identifier in the supported-device table.
#[must_use]
pub fn device_info(device_id: u32) -> Option<&'static HwInfo> {
    DEVICE_TABLE.iter().find(|info| info.device_id == device_id)
}

/// NTB port connection topology, as encoded in the PPD register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Transparent bridge — not driven by this HAL.
    Transparent,
    /// Back-to-back: two NTB ports wired together. The only supported mode.
    B2b,
    /// NTB to root port — not driven by this HAL.
    RootPort,
    /// Reserved/unknown encoding.
    Unknown(u8),
}

impl ConnectionType {
    /// Decode the two-bit PPD connection-type field.
    #[must_use]
    pub const fn from_ppd(bits: u8) -> Self {
        match bits {
            0 => Self::Transparent,
            1 => Self::B2b,
            2 => Self::RootPort,
            other => Self::Unknown(other),
        }
    }
}

/// Which side of the link this port sits on.
///
/// Determines which set of peer aperture addresses (see [`crate::b2b`])
/// gets programmed into the translation registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSide {
    /// Upstream of the crosslink.
    Upstream,
    /// Downstream of the crosslink.
    Downstream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup_finds_every_part() {
        for info in DEVICE_TABLE {
            let found = device_info(info.device_id).expect("table entry resolves");
            assert_eq!(found.family, info.family);
        }
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(device_info(devid(INTEL_VENDOR_ID, 0x1234)).is_none());
        assert!(device_info(0).is_none());
    }

    #[test]
    fn soc_part_carries_no_errata() {
        let info = device_info(devid(INTEL_VENDOR_ID, device_id::SOC_S1200)).unwrap();
        assert_eq!(info.features, Features(0));
        assert_eq!(info.family, Family::Soc);
    }

    #[test]
    fn ivt_carries_bar_size_erratum() {
        let info = device_info(devid(INTEL_VENDOR_ID, device_id::XEON_IVT)).unwrap();
        assert!(info.features.has(Features::BAR_SIZE_4K));
        assert!(info.features.has(Features::REGS_THRU_MW));
    }

    #[test]
    fn feature_set_ops() {
        let f = Features::REGS_THRU_MW.with(Features::SPLIT_BAR);
        assert!(f.has(Features::REGS_THRU_MW));
        assert!(f.has(Features::SPLIT_BAR));
        assert!(!f.has(Features::BAR_SIZE_4K));
    }

    #[test]
    fn connection_type_decoding() {
        assert_eq!(ConnectionType::from_ppd(1), ConnectionType::B2b);
        assert_eq!(ConnectionType::from_ppd(0), ConnectionType::Transparent);
        assert_eq!(ConnectionType::from_ppd(3), ConnectionType::Unknown(3));
    }
}
