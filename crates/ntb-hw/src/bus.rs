//! The platform boundary: PCI bus access and mapped MMIO apertures.
//!
//! Everything the driver needs from the host platform goes through
//! [`PciBus`]; the rest of the crate never touches a file descriptor or a
//! raw pointer directly. Two implementations ship with the crate:
//! [`VfioBus`](crate::bus::vfio::VfioBus) for real hardware and
//! [`SimBus`](crate::bus::sim::SimBus) for CI without hardware.

pub mod sim;
pub mod vfio;

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;

/// A mapped MMIO aperture.
///
/// Reads and writes are volatile on real hardware. Offsets are byte
/// offsets from the start of the aperture; accesses must be naturally
/// aligned and in bounds (implementations panic otherwise, matching the
/// hardware contract that register offsets are compile-time constants).
pub trait MmioSpace: Send + Sync + Debug {
    /// Read an 8-bit register.
    fn read8(&self, offset: u64) -> u8;
    /// Read a 16-bit register.
    fn read16(&self, offset: u64) -> u16;
    /// Read a 32-bit register.
    fn read32(&self, offset: u64) -> u32;
    /// Read a 64-bit register.
    fn read64(&self, offset: u64) -> u64;
    /// Write an 8-bit register.
    fn write8(&self, offset: u64, value: u8);
    /// Write a 16-bit register.
    fn write16(&self, offset: u64, value: u16);
    /// Write a 32-bit register.
    fn write32(&self, offset: u64, value: u32);
    /// Write a 64-bit register.
    fn write64(&self, offset: u64, value: u64);
    /// Aperture size in bytes.
    fn len(&self) -> u64;
    /// True if the aperture is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Host virtual base address, when the aperture is a real mapping.
    fn vbase(&self) -> Option<*mut u8> {
        None
    }
}

/// One allocated and mapped PCI memory aperture.
#[derive(Debug)]
pub struct MappedBar {
    /// Config-space offset of the BAR register this aperture came from.
    pub resource_id: u8,
    /// Bus physical base address.
    pub pbase: u64,
    /// Aperture size in bytes.
    pub size: u64,
    /// The mapped register/data space.
    pub space: Arc<dyn MmioSpace>,
}

/// Which interrupt source a handler is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptVector {
    /// One message-signaled vector (0-based message index).
    Msix(u32),
    /// The shared legacy interrupt line.
    Legacy,
}

/// Handler invoked in interrupt context when a vector fires.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Opaque token identifying one installed interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntrTag(
    /// Bus-assigned identifier.
    pub u64,
);

/// Host-platform services for one PCI device.
///
/// This is the attach-framework boundary: the caller discovers the device,
/// builds a `PciBus` for it, and hands it to
/// [`NtbDevice::attach`](crate::NtbDevice::attach). Attach and detach are
/// not reentrant; the caller must not invoke them concurrently with
/// doorbell or link activity.
pub trait PciBus: Send + Sync + Debug {
    /// Combined `(device << 16) | vendor` identifier of the device.
    fn device_id(&self) -> u32;

    /// Read 8 bits of config space.
    fn config_read8(&self, offset: u32) -> u8;
    /// Read 16 bits of config space.
    fn config_read16(&self, offset: u32) -> u16;
    /// Read 32 bits of config space.
    fn config_read32(&self, offset: u32) -> u32;
    /// Write 8 bits of config space.
    fn config_write8(&self, offset: u32, value: u8);
    /// Write 16 bits of config space.
    fn config_write16(&self, offset: u32, value: u16);
    /// Write 32 bits of config space.
    fn config_write32(&self, offset: u32, value: u32);

    /// Allocate and map the memory aperture behind a BAR register.
    ///
    /// # Errors
    ///
    /// [`NtbError::ResourceUnavailable`](crate::NtbError::ResourceUnavailable)
    /// if the platform cannot provide the aperture.
    fn map_bar(&self, resource_id: u8) -> Result<MappedBar>;

    /// Grow a mapped aperture to `size` bytes (BAR-size misreport erratum).
    ///
    /// # Errors
    ///
    /// [`NtbError::ResourceUnavailable`](crate::NtbError::ResourceUnavailable)
    /// if the platform has not reserved enough address space.
    fn resize_bar(&self, bar: &mut MappedBar, size: u64) -> Result<()>;

    /// Switch a mapped aperture to write-combining.
    ///
    /// # Errors
    ///
    /// [`NtbError::ResourceConfiguration`](crate::NtbError::ResourceConfiguration)
    /// if the platform rejects the attribute change.
    fn set_write_combining(&self, bar: &mut MappedBar) -> Result<()>;

    /// Release a previously mapped aperture.
    fn release_bar(&self, bar: MappedBar);

    /// Number of MSI-X vectors the platform can provide for this device.
    fn msix_count(&self) -> u32;

    /// Allocate up to `count` MSI-X vectors; returns the granted count,
    /// which may be smaller.
    ///
    /// # Errors
    ///
    /// [`NtbError::ResourceUnavailable`](crate::NtbError::ResourceUnavailable)
    /// if message-signaled interrupts are unavailable entirely.
    fn alloc_msix(&self, count: u32) -> Result<u32>;

    /// Redistribute `desired` message indices onto already-granted vectors;
    /// `vectors[i]` is the 0-based physical vector servicing message `i`.
    ///
    /// # Errors
    ///
    /// [`NtbError::ResourceUnavailable`](crate::NtbError::ResourceUnavailable)
    /// if the platform cannot reprogram the message table.
    fn remap_msix(&self, desired: u32, vectors: &[u32]) -> Result<()>;

    /// Release every allocated MSI-X vector.
    fn release_msix(&self);

    /// Install an interrupt handler. The handler runs in interrupt context
    /// and must not block.
    ///
    /// # Errors
    ///
    /// [`NtbError::ResourceUnavailable`](crate::NtbError::ResourceUnavailable)
    /// if the vector cannot be wired up.
    fn setup_interrupt(&self, vector: InterruptVector, handler: IrqHandler) -> Result<IntrTag>;

    /// Remove a previously installed interrupt handler.
    fn teardown_interrupt(&self, tag: IntrTag);

    /// Enable memory-space decoding and bus mastering on the local side.
    fn enable_busmaster(&self);
}
