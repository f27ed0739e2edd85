//! User-space hardware abstraction layer for Intel Non-Transparent
//! Bridge (NTB) PCIe devices.
//!
//! An NTB connects two independent hosts over a PCIe link and exposes
//! three primitives to a transport layer built on top: scratchpad
//! registers for short out-of-band values, doorbells that raise
//! interrupts on the peer, and translated memory windows for bulk data.
//! This crate detects the silicon variant, maps the register and
//! memory-window apertures (working around the known BAR-size and
//! register-access errata), brings up MSI-X with round-robin remap and
//! legacy fallback, dispatches per-doorbell callbacks outside interrupt
//! context, and tracks and recovers the physical link.
//!
//! # Backend hierarchy
//!
//! ```text
//! Production:
//!   VfioBus — VFIO/IOMMU access to real hardware (no kernel module)
//!
//! Development / CI:
//!   SimBus  — software NTB model, no hardware required
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ntb_hw::{NtbDevice, VfioBus};
//!
//! # fn main() -> ntb_hw::Result<()> {
//! let bus = Arc::new(VfioBus::open("0000:02:00.0")?);
//! let ntb = NtbDevice::attach(bus)?;
//!
//! ntb.register_event_callback(|event| println!("link event: {event:?}"))?;
//! ntb.write_local_spad(0, 0xDEAD_BEEF)?;
//! ntb.ring_doorbell(0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]

mod bars;
pub mod bus;
mod callout;
mod config;
mod device;
mod error;
mod interrupt;
mod link;
mod regmap;

/// Hardware identification constants (re-exported from ntb-regs).
pub mod ids {
    pub use ntb_regs::ident::device_id;
    pub use ntb_regs::ident::{DEVICE_TABLE, INTEL_VENDOR_ID};
}

pub use bus::sim::SimBus;
pub use bus::vfio::VfioBus;
pub use bus::{InterruptVector, IntrTag, IrqHandler, MappedBar, MmioSpace, PciBus};
pub use config::Tunables;
pub use device::{DbCallback, EventCallback, NtbDevice};
pub use error::{NtbError, Result};
pub use link::{LinkEvent, LinkState};
pub use ntb_regs::{Family, Features};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Family, Features, LinkEvent, NtbDevice, NtbError, PciBus, Result, SimBus, Tunables,
        VfioBus,
    };
}
