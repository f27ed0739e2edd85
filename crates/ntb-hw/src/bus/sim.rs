//! Software NTB model.
//!
//! Implements [`PciBus`] over plain memory so the whole driver — variant
//! detection, BAR mapping, interrupt setup, doorbell dispatch, link
//! recovery — runs without hardware. CI uses it the same way the tests
//! do; nothing in the driver knows the difference.
//!
//! The model is deliberately thin: config space and apertures are byte
//! arrays, the doorbell registers are write-one-to-clear, the PHY error
//! registers clear on write like the silicon, and everything else is
//! plain storage the test scripts by poking registers.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ntb_regs::{ident, pci, soc, xeon};

use crate::bus::{InterruptVector, IntrTag, IrqHandler, MappedBar, MmioSpace, PciBus};
use crate::error::{NtbError, Result};

/// One simulated aperture: backing storage, write-one-to-clear ranges,
/// and a write log the tests can assert against.
pub struct SimMem {
    data: Mutex<Vec<u8>>,
    w1c: Vec<std::ops::Range<u64>>,
    writes: Mutex<Vec<(u64, u64, u8)>>,
}

impl SimMem {
    fn new(size: usize, w1c: Vec<std::ops::Range<u64>>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; size]),
            w1c,
            writes: Mutex::new(Vec::new()),
        })
    }

    fn load(&self, offset: u64, width: usize) -> u64 {
        let data = self.data.lock().unwrap();
        let offset = usize::try_from(offset).unwrap();
        assert!(offset + width <= data.len(), "register offset out of bounds");
        let mut value = 0u64;
        for (i, byte) in data[offset..offset + width].iter().enumerate() {
            value |= u64::from(*byte) << (8 * i);
        }
        value
    }

    fn store(&self, offset: u64, width: usize, value: u64) {
        let is_w1c = self.w1c.iter().any(|r| r.contains(&offset));
        {
            let mut data = self.data.lock().unwrap();
            let at = usize::try_from(offset).unwrap();
            assert!(at + width <= data.len(), "register offset out of bounds");
            let mut current = 0u64;
            for (i, byte) in data[at..at + width].iter().enumerate() {
                current |= u64::from(*byte) << (8 * i);
            }
            let next = if is_w1c { current & !value } else { value };
            for i in 0..width {
                data[at + i] = (next >> (8 * i)) as u8;
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        self.writes.lock().unwrap().push((offset, value, width as u8));
    }

    /// Overwrite a register directly, bypassing write-one-to-clear.
    pub fn poke(&self, offset: u64, width: usize, value: u64) {
        let mut data = self.data.lock().unwrap();
        let at = usize::try_from(offset).unwrap();
        assert!(at + width <= data.len(), "register offset out of bounds");
        for i in 0..width {
            data[at + i] = (value >> (8 * i)) as u8;
        }
    }

    /// Read a register without logging.
    #[must_use]
    pub fn peek(&self, offset: u64, width: usize) -> u64 {
        self.load(offset, width)
    }

    /// Every value written to `offset` through the driver, oldest first.
    #[must_use]
    pub fn writes_to(&self, offset: u64) -> Vec<u64> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _, _)| *o == offset)
            .map(|(_, v, _)| *v)
            .collect()
    }
}

impl std::fmt::Debug for SimMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimMem")
            .field("len", &self.data.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl MmioSpace for SimMem {
    fn read8(&self, offset: u64) -> u8 {
        self.load(offset, 1) as u8
    }
    fn read16(&self, offset: u64) -> u16 {
        self.load(offset, 2) as u16
    }
    fn read32(&self, offset: u64) -> u32 {
        self.load(offset, 4) as u32
    }
    fn read64(&self, offset: u64) -> u64 {
        self.load(offset, 8)
    }
    fn write8(&self, offset: u64, value: u8) {
        self.store(offset, 1, u64::from(value));
    }
    fn write16(&self, offset: u64, value: u16) {
        self.store(offset, 2, u64::from(value));
    }
    fn write32(&self, offset: u64, value: u32) {
        self.store(offset, 4, u64::from(value));
    }
    fn write64(&self, offset: u64, value: u64) {
        self.store(offset, 8, value);
    }
    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }
}

#[derive(Default)]
struct SimCounters {
    msix_allocated: u32,
    msix_released: u32,
    released_bars: Vec<u8>,
    write_combined: Vec<u8>,
    busmaster_enabled: bool,
}

/// Software NTB device exposed through [`PciBus`].
pub struct SimBus {
    device_id: u32,
    config: Mutex<Vec<u8>>,
    bars: HashMap<u8, Arc<SimMem>>,
    msix_count: u32,
    msix_grant: u32,
    fail_msix: bool,
    fail_remap: bool,
    fail_resize: bool,
    fail_wc: bool,
    remap: Mutex<Option<(u32, Vec<u32>)>>,
    handlers: Mutex<HashMap<InterruptVector, Arc<IrqHandler>>>,
    tags: Mutex<HashMap<IntrTag, InterruptVector>>,
    next_tag: AtomicU64,
    counters: Mutex<SimCounters>,
}

impl SimBus {
    const BAR0_SIZE: usize = 0x20000;
    const DATA_BAR_SIZE: usize = 0x10000;

    /// A SoC (Atom S1200) part: upstream side, B2B, link initially up.
    #[must_use]
    pub fn soc() -> Self {
        let mut bus = Self::empty(pci::devid(ident::INTEL_VENDOR_ID, ident::device_id::SOC_S1200));
        // PPD: connection type B2B in bits 9:8, upstream (dev-type clear).
        bus.config_write_raw(pci::PPD_OFFSET, 4, 1 << 8);
        let bar0_w1c = vec![
            soc::PDOORBELL_OFFSET..soc::PDOORBELL_OFFSET + 8,
            soc::ERRCORSTS_OFFSET..soc::ERRCORSTS_OFFSET + 4,
            soc::LTSSMERRSTS0_OFFSET..soc::LTSSMERRSTS0_OFFSET + 4,
            soc::DESKEWSTS_OFFSET..soc::DESKEWSTS_OFFSET + 4,
            soc::IBSTERRRCRVSTS0_OFFSET..soc::IBSTERRRCRVSTS0_OFFSET + 4,
        ];
        bus.bars.insert(pci::bar_offset(0) as u8, SimMem::new(Self::BAR0_SIZE, bar0_w1c));
        bus.bars.insert(pci::bar_offset(2) as u8, SimMem::new(Self::DATA_BAR_SIZE, Vec::new()));
        bus.bars.insert(pci::bar_offset(4) as u8, SimMem::new(Self::DATA_BAR_SIZE, Vec::new()));
        // Negotiated x1 Gen1 on the shadowed link-status register.
        bus.bar_mem(pci::bar_offset(0) as u8)
            .poke(soc::LINK_STATUS_OFFSET, 2, u64::from(1u16 << 4 | 1));
        bus.msix_count = u32::from(soc::MSIX_CNT);
        bus.msix_grant = u32::from(soc::MSIX_CNT);
        bus
    }

    /// A Xeon (SNB) part: upstream side, B2B, register-through-window and
    /// doorbell-bit-14 errata, link active in config space.
    #[must_use]
    pub fn xeon() -> Self {
        let mut bus = Self::empty(pci::devid(ident::INTEL_VENDOR_ID, ident::device_id::XEON_SNB));
        // PPD: connection type B2B, upstream.
        bus.config_write_raw(
            pci::PPD_OFFSET,
            1,
            u64::from(1u8 | xeon::PPD_DEV_TYPE),
        );
        // Link active, x8 Gen2.
        bus.config_write_raw(
            xeon::LINK_STATUS_OFFSET,
            2,
            u64::from(ntb_regs::link::STATUS_ACTIVE | 8 << 4 | 2),
        );
        let bar0_w1c = vec![xeon::PDOORBELL_OFFSET..xeon::PDOORBELL_OFFSET + 2];
        bus.bars.insert(pci::bar_offset(0) as u8, SimMem::new(Self::BAR0_SIZE, bar0_w1c));
        bus.bars.insert(pci::bar_offset(2) as u8, SimMem::new(Self::DATA_BAR_SIZE, Vec::new()));
        bus.bars.insert(pci::bar_offset(4) as u8, SimMem::new(Self::DATA_BAR_SIZE, Vec::new()));
        bus.msix_count = u32::from(xeon::MSIX_CNT);
        bus.msix_grant = u32::from(xeon::MSIX_CNT);
        bus
    }

    fn empty(device_id: u32) -> Self {
        let bus = Self {
            device_id,
            config: Mutex::new(vec![0; 4096]),
            bars: HashMap::new(),
            msix_count: 0,
            msix_grant: 0,
            fail_msix: false,
            fail_remap: false,
            fail_resize: false,
            fail_wc: false,
            remap: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            tags: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            counters: Mutex::new(SimCounters::default()),
        };
        let mut cfg = bus.config.lock().unwrap();
        cfg[0] = device_id as u8;
        cfg[1] = (device_id >> 8) as u8;
        cfg[2] = (device_id >> 16) as u8;
        cfg[3] = (device_id >> 24) as u8;
        drop(cfg);
        bus
    }

    /// Replace the combined device identifier (vendor in the low half).
    #[must_use]
    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self.config_write_raw(0, 4, u64::from(device_id));
        self
    }

    /// Pretend the platform only grants this many MSI-X vectors even when
    /// more are requested.
    #[must_use]
    pub fn with_msix_grant(mut self, grant: u32) -> Self {
        self.msix_grant = grant;
        self
    }

    /// Fail MSI-X allocation entirely.
    #[must_use]
    pub fn without_msix(mut self) -> Self {
        self.fail_msix = true;
        self
    }

    /// Reject MSI-X remap requests.
    #[must_use]
    pub fn with_remap_failure(mut self) -> Self {
        self.fail_remap = true;
        self
    }

    /// Reject BAR resize requests.
    #[must_use]
    pub fn with_resize_failure(mut self) -> Self {
        self.fail_resize = true;
        self
    }

    /// Reject write-combining requests.
    #[must_use]
    pub fn with_wc_failure(mut self) -> Self {
        self.fail_wc = true;
        self
    }

    /// Direct handle to a simulated aperture, for scripting registers.
    ///
    /// # Panics
    ///
    /// Panics if no aperture sits behind `resource_id`.
    #[must_use]
    pub fn bar_mem(&self, resource_id: u8) -> Arc<SimMem> {
        Arc::clone(self.bars.get(&resource_id).expect("no such BAR"))
    }

    /// Write config space directly.
    pub fn config_write_raw(&self, offset: u32, width: usize, value: u64) {
        let mut cfg = self.config.lock().unwrap();
        let at = offset as usize;
        for i in 0..width {
            cfg[at + i] = (value >> (8 * i)) as u8;
        }
    }

    fn config_read_raw(&self, offset: u32, width: usize) -> u64 {
        let cfg = self.config.lock().unwrap();
        let at = offset as usize;
        let mut value = 0u64;
        for i in 0..width {
            value |= u64::from(cfg[at + i]) << (8 * i);
        }
        value
    }

    /// Raise one MSI-X vector, as the hardware would.
    pub fn trigger_msix(&self, vector: u32) {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&InterruptVector::Msix(vector))
            .cloned();
        if let Some(handler) = handler {
            (*handler)();
        }
    }

    /// Raise the shared legacy line.
    pub fn trigger_legacy(&self) {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&InterruptVector::Legacy)
            .cloned();
        if let Some(handler) = handler {
            (*handler)();
        }
    }

    /// The message-to-vector table from the last remap request.
    #[must_use]
    pub fn recorded_remap(&self) -> Option<(u32, Vec<u32>)> {
        self.remap.lock().unwrap().clone()
    }

    /// Resource IDs released so far, in release order.
    #[must_use]
    pub fn released_bars(&self) -> Vec<u8> {
        self.counters.lock().unwrap().released_bars.clone()
    }

    /// Resource IDs that were switched to write-combining.
    #[must_use]
    pub fn write_combined(&self) -> Vec<u8> {
        self.counters.lock().unwrap().write_combined.clone()
    }

    /// Vectors currently allocated (0 after release).
    #[must_use]
    pub fn msix_allocated(&self) -> u32 {
        self.counters.lock().unwrap().msix_allocated
    }

    /// How often the vector allocation was released.
    #[must_use]
    pub fn msix_released(&self) -> u32 {
        self.counters.lock().unwrap().msix_released
    }

    /// Installed interrupt vectors, for asserting the handler layout.
    #[must_use]
    pub fn installed_vectors(&self) -> Vec<InterruptVector> {
        let mut vectors: Vec<InterruptVector> =
            self.handlers.lock().unwrap().keys().copied().collect();
        vectors.sort_by_key(|v| match v {
            InterruptVector::Msix(n) => i64::from(*n),
            InterruptVector::Legacy => -1,
        });
        vectors
    }

    /// True once the driver enabled bus mastering.
    #[must_use]
    pub fn busmaster_enabled(&self) -> bool {
        self.counters.lock().unwrap().busmaster_enabled
    }
}

impl std::fmt::Debug for SimBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBus")
            .field("device_id", &format_args!("{:#010x}", self.device_id))
            .field("msix_count", &self.msix_count)
            .finish_non_exhaustive()
    }
}

impl PciBus for SimBus {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn config_read8(&self, offset: u32) -> u8 {
        self.config_read_raw(offset, 1) as u8
    }
    fn config_read16(&self, offset: u32) -> u16 {
        self.config_read_raw(offset, 2) as u16
    }
    fn config_read32(&self, offset: u32) -> u32 {
        self.config_read_raw(offset, 4) as u32
    }
    fn config_write8(&self, offset: u32, value: u8) {
        self.config_write_raw(offset, 1, u64::from(value));
    }
    fn config_write16(&self, offset: u32, value: u16) {
        self.config_write_raw(offset, 2, u64::from(value));
    }
    fn config_write32(&self, offset: u32, value: u32) {
        self.config_write_raw(offset, 4, u64::from(value));
    }

    fn map_bar(&self, resource_id: u8) -> Result<MappedBar> {
        let mem = self.bars.get(&resource_id).ok_or_else(|| {
            NtbError::resource_unavailable(format!("no BAR at {resource_id:#x}"))
        })?;
        Ok(MappedBar {
            resource_id,
            pbase: 0xF000_0000 + u64::from(resource_id) * 0x1000_0000,
            size: mem.len(),
            space: Arc::clone(mem) as Arc<dyn MmioSpace>,
        })
    }

    fn resize_bar(&self, bar: &mut MappedBar, size: u64) -> Result<()> {
        if self.fail_resize {
            return Err(NtbError::resource_unavailable(
                "platform rejected BAR resize",
            ));
        }
        let mem = self.bars.get(&bar.resource_id).expect("resizing unmapped BAR");
        let mut data = mem.data.lock().unwrap();
        data.resize(usize::try_from(size).unwrap(), 0);
        drop(data);
        bar.size = size;
        Ok(())
    }

    fn set_write_combining(&self, bar: &mut MappedBar) -> Result<()> {
        if self.fail_wc {
            return Err(NtbError::resource_configuration(
                "platform rejected write-combining",
            ));
        }
        self.counters
            .lock()
            .unwrap()
            .write_combined
            .push(bar.resource_id);
        Ok(())
    }

    fn release_bar(&self, bar: MappedBar) {
        self.counters
            .lock()
            .unwrap()
            .released_bars
            .push(bar.resource_id);
    }

    fn msix_count(&self) -> u32 {
        self.msix_count
    }

    fn alloc_msix(&self, count: u32) -> Result<u32> {
        if self.fail_msix {
            return Err(NtbError::resource_unavailable("MSI-X unavailable"));
        }
        let granted = count.min(self.msix_grant);
        self.counters.lock().unwrap().msix_allocated = granted;
        Ok(granted)
    }

    fn remap_msix(&self, desired: u32, vectors: &[u32]) -> Result<()> {
        if self.fail_remap {
            return Err(NtbError::resource_unavailable("remap rejected"));
        }
        *self.remap.lock().unwrap() = Some((desired, vectors.to_vec()));
        Ok(())
    }

    fn release_msix(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.msix_allocated = 0;
        counters.msix_released += 1;
    }

    fn setup_interrupt(&self, vector: InterruptVector, handler: IrqHandler) -> Result<IntrTag> {
        let tag = IntrTag(self.next_tag.fetch_add(1, Ordering::SeqCst));
        self.handlers.lock().unwrap().insert(vector, Arc::new(handler));
        self.tags.lock().unwrap().insert(tag, vector);
        Ok(tag)
    }

    fn teardown_interrupt(&self, tag: IntrTag) {
        if let Some(vector) = self.tags.lock().unwrap().remove(&tag) {
            self.handlers.lock().unwrap().remove(&vector);
        }
    }

    fn enable_busmaster(&self) {
        self.counters.lock().unwrap().busmaster_enabled = true;
    }
}
