//! Silicon model for Intel Non-Transparent Bridge (NTB) hardware.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the silicon: PCI identifiers, per-family register maps,
//! erratum/feature bits, and link-training bit definitions for the two NTB
//! families (Xeon and Atom SoC).
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ident`] | Vendor/device IDs, hardware families, feature/erratum bits |
//! | [`pci`] | Generic PCI config-space offsets and command bits |
//! | [`xeon`] | Xeon NTB register map and limits |
//! | [`soc`] | Atom SoC NTB register map, limits, and PHY/LTSSM registers |
//! | [`link`] | NTB control and PCIe link-status bit definitions |
//! | [`b2b`] | Back-to-back peer aperture addresses (USD/DSD directions) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod b2b;
pub mod ident;
pub mod link;
pub mod pci;
pub mod soc;
pub mod xeon;

pub use ident::{device_info, ConnectionType, DeviceSide, Family, Features, HwInfo};
