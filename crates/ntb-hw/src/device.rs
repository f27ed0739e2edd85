//! Device context, attach/detach orchestration, and the public API the
//! transport layer consumes.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use ntb_regs::{
    b2b, device_info, pci, soc, xeon, ConnectionType, DeviceSide, Family, Features,
};
use tracing::{debug, info, warn};

use crate::bars::{self, MAX_BARS, NTB_CONFIG_BAR};
use crate::bus::{MappedBar, MmioSpace, PciBus};
use crate::callout::{Callout, TimerWheel};
use crate::config::Tunables;
use crate::error::{NtbError, Result};
use crate::interrupt::{self, CallbackTable, IrqState};
use crate::link::{self, LinkEvent, LinkInner, LinkState};
use crate::regmap::{bits_per_vector, Limits, RegisterOffsets};

/// Callback invoked outside interrupt context when a registered doorbell
/// rings. The return value is a progress flag: `true` means more work
/// remains and the callback is immediately rescheduled with the doorbell
/// still masked; `false` unmasks the doorbell.
pub type DbCallback = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// Callback invoked on real link transitions.
pub type EventCallback = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// The single owning context for one physical NTB device.
pub(crate) struct DeviceInner {
    pub(crate) bus: Arc<dyn PciBus>,
    pub(crate) tunables: Tunables,
    pub(crate) family: Family,
    pub(crate) features: Features,
    pub(crate) side: DeviceSide,
    pub(crate) ppd: u32,
    pub(crate) limits: Limits,
    pub(crate) regs: RegisterOffsets,
    pub(crate) bits_per_vector: u8,

    /// Mapped apertures by BAR index; populated before the context is
    /// shared, so register access never takes a lock.
    spaces: [Option<Arc<dyn MmioSpace>>; MAX_BARS],
    /// Resource bookkeeping for the same apertures.
    pub(crate) bar_records: Mutex<[Option<MappedBar>; MAX_BARS]>,

    pub(crate) irq: Mutex<IrqState>,
    pub(crate) callbacks: Mutex<CallbackTable>,
    /// Serializes the doorbell-mask read-modify-write, which runs from
    /// both interrupt and timer context.
    pub(crate) db_mask_lock: Mutex<()>,

    pub(crate) link: Mutex<LinkInner>,
    pub(crate) event_cb: Mutex<Option<EventCallback>>,
    pub(crate) transport: Mutex<Option<Weak<dyn Any + Send + Sync>>>,

    pub(crate) wheel: TimerWheel,
    pub(crate) heartbeat: OnceLock<Callout>,
    pub(crate) recovery: OnceLock<Callout>,

    detached: AtomicBool,
}

impl DeviceInner {
    fn space(&self, index: usize) -> &dyn MmioSpace {
        self.spaces[index]
            .as_deref()
            .expect("BAR aperture not mapped")
    }

    pub(crate) fn reg_read8(&self, offset: u64) -> u8 {
        self.space(NTB_CONFIG_BAR).read8(offset)
    }

    pub(crate) fn reg_read16(&self, offset: u64) -> u16 {
        self.space(NTB_CONFIG_BAR).read16(offset)
    }

    pub(crate) fn reg_read32(&self, offset: u64) -> u32 {
        self.space(NTB_CONFIG_BAR).read32(offset)
    }

    pub(crate) fn reg_write8(&self, offset: u64, value: u8) {
        self.space(NTB_CONFIG_BAR).write8(offset, value);
    }

    pub(crate) fn reg_write16(&self, offset: u64, value: u16) {
        self.space(NTB_CONFIG_BAR).write16(offset, value);
    }

    pub(crate) fn reg_write32(&self, offset: u64, value: u32) {
        self.space(NTB_CONFIG_BAR).write32(offset, value);
    }

    pub(crate) fn reg_write64(&self, offset: u64, value: u64) {
        self.space(NTB_CONFIG_BAR).write64(offset, value);
    }

    /// The aperture that shadows the peer's register space under the
    /// register-through-window erratum: the window just past the last
    /// transport-visible one.
    pub(crate) fn mw_space(&self) -> &dyn MmioSpace {
        self.space(bars::mw_to_bar(usize::from(self.limits.max_mw)))
    }

    /// Doorbell-register read at the family's width (64-bit on SoC,
    /// 16-bit on Xeon).
    pub(crate) fn db_read(&self, offset: u64) -> u64 {
        match self.family {
            Family::Soc => self.space(NTB_CONFIG_BAR).read64(offset),
            Family::Xeon => u64::from(self.space(NTB_CONFIG_BAR).read16(offset)),
        }
    }

    /// Doorbell-register write at the family's width.
    pub(crate) fn db_write(&self, offset: u64, value: u64) {
        match self.family {
            Family::Soc => self.space(NTB_CONFIG_BAR).write64(offset, value),
            Family::Xeon => {
                #[allow(clippy::cast_possible_truncation)]
                self.space(NTB_CONFIG_BAR).write16(offset, value as u16);
            }
        }
    }

    fn bar_size(&self, index: usize) -> u64 {
        self.bar_records.lock().unwrap()[index]
            .as_ref()
            .map_or(0, |bar| bar.size)
    }

    /// True once teardown has started. Timer callbacks check this so an
    /// in-flight firing cannot re-arm a timer that detach already drained.
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DeviceInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInner")
            .field("family", &self.family)
            .field("features", &self.features)
            .field("side", &self.side)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Handle to one attached NTB device.
///
/// Created by [`NtbDevice::attach`]; dropping it (or calling
/// [`NtbDevice::detach`]) drains the link timers, tears down interrupts —
/// implicitly unregistering every doorbell callback — and releases the
/// mapped apertures, in that order.
#[derive(Debug)]
pub struct NtbDevice {
    inner: Arc<DeviceInner>,
}

impl NtbDevice {
    /// Attach to the device behind `bus`, with tunables from the
    /// environment.
    ///
    /// # Errors
    ///
    /// [`NtbError::UnsupportedConfiguration`] for an unrecognized device
    /// or a non-B2B topology; [`NtbError::ResourceUnavailable`] /
    /// [`NtbError::ResourceConfiguration`] for BAR or interrupt failures.
    /// Any failure rolls back everything already acquired.
    pub fn attach(bus: Arc<dyn PciBus>) -> Result<Self> {
        Self::attach_with(bus, Tunables::from_env())
    }

    /// Attach with explicit tunables.
    ///
    /// # Errors
    ///
    /// See [`NtbDevice::attach`].
    pub fn attach_with(bus: Arc<dyn PciBus>, tunables: Tunables) -> Result<Self> {
        let device_id = bus.device_id();
        let hw = device_info(device_id).ok_or_else(|| {
            NtbError::unsupported(format!("unrecognized device {device_id:#010x}"))
        })?;
        info!(desc = hw.desc, device_id = format_args!("{device_id:#010x}"), "attaching");

        let mut features = hw.features;
        let (ppd, side) = match hw.family {
            Family::Xeon => detect_xeon(bus.as_ref(), &mut features)?,
            Family::Soc => detect_soc(bus.as_ref())?,
        };

        let limits = Limits::compute(hw.family, features);
        let regs = RegisterOffsets::compute(hw.family, features);
        let bars = bars::map_pci_bars(bus.as_ref(), features)?;

        let mut spaces: [Option<Arc<dyn MmioSpace>>; MAX_BARS] = [None, None, None, None];
        for (slot, bar) in spaces.iter_mut().zip(bars.iter()) {
            *slot = bar.as_ref().map(|bar| Arc::clone(&bar.space));
        }

        let inner = Arc::new(DeviceInner {
            bus,
            tunables,
            family: hw.family,
            features,
            side,
            ppd,
            limits,
            regs,
            bits_per_vector: bits_per_vector(hw.family),
            spaces,
            bar_records: Mutex::new(bars),
            irq: Mutex::new(IrqState::default()),
            callbacks: Mutex::new(CallbackTable::default()),
            db_mask_lock: Mutex::new(()),
            link: Mutex::new(LinkInner::default()),
            event_cb: Mutex::new(None),
            transport: Mutex::new(None),
            wheel: TimerWheel::new("ntb-hw"),
            heartbeat: OnceLock::new(),
            recovery: OnceLock::new(),
            detached: AtomicBool::new(false),
        });

        match inner.family {
            Family::Xeon => setup_xeon(&inner),
            Family::Soc => setup_soc(&inner),
        }

        if let Err(e) = interrupt::setup_interrupts(&inner) {
            teardown_inner(&inner);
            return Err(e);
        }

        link::start_timers(&inner);
        inner.bus.enable_busmaster();

        Ok(Self { inner })
    }

    /// Detach: drain timers, tear down interrupts (unregistering every
    /// callback), release apertures.
    pub fn detach(self) {
        teardown_inner(&self.inner);
    }

    /// Register the link-event callback.
    ///
    /// # Errors
    ///
    /// [`NtbError::AlreadyRegistered`] if one is installed.
    pub fn register_event_callback(
        &self,
        callback: impl Fn(LinkEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut slot = self.inner.event_cb.lock().unwrap();
        if slot.is_some() {
            return Err(NtbError::AlreadyRegistered {
                what: "event callback",
            });
        }
        *slot = Some(Arc::new(callback));
        Ok(())
    }

    /// Remove the link-event callback, if any.
    pub fn unregister_event_callback(&self) {
        self.inner.event_cb.lock().unwrap().take();
    }

    /// Reserve this device for a transport. The reference is held weakly;
    /// at most one transport may be registered at a time.
    ///
    /// # Errors
    ///
    /// [`NtbError::AlreadyRegistered`] if a transport is registered.
    pub fn register_transport(&self, transport: &Arc<dyn Any + Send + Sync>) -> Result<()> {
        let mut slot = self.inner.transport.lock().unwrap();
        if slot.is_some() {
            return Err(NtbError::AlreadyRegistered { what: "transport" });
        }
        *slot = Some(Arc::downgrade(transport));
        Ok(())
    }

    /// The transport registered against this device, if it is still alive.
    #[must_use]
    pub fn find_transport(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner
            .transport
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Unregister the transport: every doorbell callback and the event
    /// callback go with it.
    pub fn unregister_transport(&self) {
        if self.inner.transport.lock().unwrap().take().is_none() {
            return;
        }
        let max_cbs = self.get_max_cbs();
        for idx in 0..usize::from(max_cbs) {
            interrupt::unregister_db_callback(&self.inner, idx);
        }
        self.unregister_event_callback();
    }

    /// Register a doorbell callback and unmask that doorbell.
    ///
    /// # Errors
    ///
    /// [`NtbError::InvalidArgument`] if `idx` is out of range, occupied,
    /// or reserved for the link interrupt.
    pub fn register_db_callback(
        &self,
        idx: usize,
        callback: impl Fn(usize) -> bool + Send + Sync + 'static,
    ) -> Result<()> {
        interrupt::register_db_callback(&self.inner, idx, Arc::new(callback))
    }

    /// Mask the doorbell, wait out any in-flight deferred dispatch, and
    /// clear the slot. No callback for `idx` fires after this returns.
    /// A no-op for an empty or out-of-range slot.
    pub fn unregister_db_callback(&self, idx: usize) {
        interrupt::unregister_db_callback(&self.inner, idx);
    }

    /// Write a 32-bit value to a local scratchpad register.
    ///
    /// # Errors
    ///
    /// [`NtbError::InvalidArgument`] if `idx` is out of range.
    pub fn write_local_spad(&self, idx: usize, value: u32) -> Result<()> {
        let inner = &self.inner;
        check_spad(inner, idx)?;
        inner.reg_write32(inner.regs.spad_local + idx as u64 * 4, value);
        Ok(())
    }

    /// Read a 32-bit value from a local scratchpad register.
    ///
    /// # Errors
    ///
    /// [`NtbError::InvalidArgument`] if `idx` is out of range.
    pub fn read_local_spad(&self, idx: usize) -> Result<u32> {
        let inner = &self.inner;
        check_spad(inner, idx)?;
        Ok(inner.reg_read32(inner.regs.spad_local + idx as u64 * 4))
    }

    /// Write a 32-bit value to a peer scratchpad register. Routed through
    /// the shadow memory window when the register-through-window erratum
    /// is active.
    ///
    /// # Errors
    ///
    /// [`NtbError::InvalidArgument`] if `idx` is out of range.
    pub fn write_remote_spad(&self, idx: usize, value: u32) -> Result<()> {
        let inner = &self.inner;
        check_spad(inner, idx)?;
        if inner.features.has(Features::REGS_THRU_MW) {
            inner
                .mw_space()
                .write32(xeon::SHADOW_SPAD_OFFSET + idx as u64 * 4, value);
        } else {
            inner.reg_write32(inner.regs.spad_remote + idx as u64 * 4, value);
        }
        Ok(())
    }

    /// Read a 32-bit value from a peer scratchpad register.
    ///
    /// # Errors
    ///
    /// [`NtbError::InvalidArgument`] if `idx` is out of range.
    pub fn read_remote_spad(&self, idx: usize) -> Result<u32> {
        let inner = &self.inner;
        check_spad(inner, idx)?;
        if inner.features.has(Features::REGS_THRU_MW) {
            Ok(inner
                .mw_space()
                .read32(xeon::SHADOW_SPAD_OFFSET + idx as u64 * 4))
        } else {
            Ok(inner.reg_read32(inner.regs.spad_remote + idx as u64 * 4))
        }
    }

    /// Host virtual base of a memory window, or `None` if the window does
    /// not exist (or the platform mapping has no direct pointer).
    #[must_use]
    pub fn get_mw_vbase(&self, mw: usize) -> Option<*mut u8> {
        if mw >= usize::from(self.inner.limits.max_mw) {
            return None;
        }
        self.inner.space(bars::mw_to_bar(mw)).vbase()
    }

    /// Bus physical base of a memory window.
    #[must_use]
    pub fn get_mw_pbase(&self, mw: usize) -> Option<u64> {
        if mw >= usize::from(self.inner.limits.max_mw) {
            return None;
        }
        self.inner.bar_records.lock().unwrap()[bars::mw_to_bar(mw)]
            .as_ref()
            .map(|bar| bar.pbase)
    }

    /// Size of a memory window in bytes.
    #[must_use]
    pub fn get_mw_size(&self, mw: usize) -> Option<u64> {
        if mw >= usize::from(self.inner.limits.max_mw) {
            return None;
        }
        self.inner.bar_records.lock().unwrap()[bars::mw_to_bar(mw)]
            .as_ref()
            .map(|bar| bar.size)
    }

    /// Program the translation register of a memory window with the bus
    /// address incoming peer traffic should land on. Silently ignored for
    /// an out-of-range window.
    pub fn set_mw_addr(&self, mw: usize, addr: u64) {
        let inner = &self.inner;
        if mw >= usize::from(inner.limits.max_mw) {
            warn!(mw, "set_mw_addr: no such memory window");
            return;
        }
        match bars::mw_to_bar(mw) {
            1 => inner.reg_write64(inner.regs.bar2_xlat, addr),
            2 => {
                if inner.features.has(Features::SPLIT_BAR) {
                    #[allow(clippy::cast_possible_truncation)]
                    inner.reg_write32(inner.regs.bar4_xlat, addr as u32);
                } else {
                    inner.reg_write64(inner.regs.bar4_xlat, addr);
                }
            }
            3 => {
                if let Some(bar5_xlat) = inner.regs.bar5_xlat {
                    #[allow(clippy::cast_possible_truncation)]
                    inner.reg_write32(bar5_xlat, addr as u32);
                }
            }
            _ => {}
        }
    }

    /// Ring a doorbell on the peer: a single bit on SoC, the whole
    /// bits-per-vector group on Xeon. Routed through the shadow window
    /// when the register-through-window erratum is active.
    pub fn ring_doorbell(&self, db: usize) {
        let inner = &self.inner;
        let bits = match inner.family {
            Family::Soc => 1u64 << db,
            Family::Xeon => {
                let group = (1u64 << inner.bits_per_vector) - 1;
                group << (db * usize::from(inner.bits_per_vector))
            }
        };
        if inner.features.has(Features::REGS_THRU_MW) {
            #[allow(clippy::cast_possible_truncation)]
            inner
                .mw_space()
                .write16(xeon::SHADOW_PDOORBELL_OFFSET, bits as u16);
            return;
        }
        inner.db_write(inner.regs.rdb, bits);
    }

    /// True if the hardware link to the peer is up.
    #[must_use]
    pub fn query_link_status(&self) -> bool {
        self.inner.link.lock().unwrap().state == LinkState::Up
    }

    /// Scratchpad registers usable by the transport.
    #[must_use]
    pub fn get_max_spads(&self) -> u8 {
        self.inner.limits.max_spads
    }

    /// Doorbell callback slots usable by the transport.
    #[must_use]
    pub fn get_max_cbs(&self) -> u8 {
        self.inner.callbacks.lock().unwrap().max_cbs
    }

    /// Memory windows usable by the transport.
    #[must_use]
    pub fn get_max_mw(&self) -> u8 {
        self.inner.limits.max_mw
    }

    /// The detected hardware family.
    #[must_use]
    pub fn family(&self) -> Family {
        self.inner.family
    }

    /// True if every bit of `features` is active for this part.
    #[must_use]
    pub fn has_feature(&self, features: Features) -> bool {
        self.inner.features.has(features)
    }
}

impl Drop for NtbDevice {
    fn drop(&mut self) {
        teardown_inner(&self.inner);
    }
}

fn check_spad(inner: &DeviceInner, idx: usize) -> Result<()> {
    if idx >= usize::from(inner.limits.max_spads) {
        return Err(NtbError::invalid_argument(format!(
            "scratchpad {idx} out of range (have {})",
            inner.limits.max_spads
        )));
    }
    Ok(())
}

fn detect_xeon(bus: &dyn PciBus, features: &mut Features) -> Result<(u32, DeviceSide)> {
    let ppd = bus.config_read8(pci::PPD_OFFSET);
    let side = if ppd & xeon::PPD_DEV_TYPE != 0 {
        DeviceSide::Upstream
    } else {
        DeviceSide::Downstream
    };
    if ppd & xeon::PPD_SPLIT_BAR != 0 {
        *features = features.with(Features::SPLIT_BAR);
    }
    let conn = ConnectionType::from_ppd(ppd & xeon::PPD_CONN_TYPE);
    if conn != ConnectionType::B2b {
        return Err(NtbError::unsupported(format!(
            "unsupported connection type {conn:?}"
        )));
    }
    debug!(ppd, ?side, "Xeon topology");
    Ok((u32::from(ppd), side))
}

fn detect_soc(bus: &dyn PciBus) -> Result<(u32, DeviceSide)> {
    let ppd = bus.config_read32(pci::PPD_OFFSET);
    let side = if ppd & soc::PPD_DEV_TYPE != 0 {
        DeviceSide::Downstream
    } else {
        DeviceSide::Upstream
    };
    #[allow(clippy::cast_possible_truncation)]
    let conn = ConnectionType::from_ppd(((ppd & soc::PPD_CONN_TYPE) >> 8) as u8);
    if conn != ConnectionType::B2b {
        return Err(NtbError::unsupported(format!(
            "unsupported connection type {conn:?}"
        )));
    }
    debug!(ppd, ?side, "SoC topology");
    Ok((ppd, side))
}

fn setup_xeon(inner: &Arc<DeviceInner>) {
    if inner.features.has(Features::REGS_THRU_MW) {
        // Keep the limit register at the window size plus one page so a
        // stray access past the shadow window faults instead of hanging.
        let window = inner.bar_size(2);
        inner.reg_write64(xeon::PBAR4LMT_OFFSET, window + 0x1000);
    } else {
        // Clear the limit; a 64-bit write also clears PBAR5LMT in
        // split-BAR mode, which is what we want.
        inner.reg_write64(xeon::PBAR4LMT_OFFSET, 0);
    }

    configure_xeon_secondary_side_bars(inner);

    // Enable memory space and bus mastering on the secondary side.
    inner.reg_write16(
        inner.regs.spci_cmd,
        pci::CMD_MEM_ENABLE | pci::CMD_BUS_MASTER,
    );

    link::hw_link_up(inner);
}

fn setup_soc(inner: &Arc<DeviceInner>) {
    // Initiate PCI-E link training.
    inner
        .bus
        .config_write32(pci::PPD_OFFSET, inner.ppd | soc::PPD_INIT_LINK);

    // Early-silicon MSI-X erratum: mask transaction-layer internal
    // parity errors.
    inner
        .bus
        .config_write32(soc::PARITY_ERRATUM_OFFSET, soc::PARITY_ERRATUM_VALUE);

    configure_soc_secondary_side_bars(inner);

    // Enable memory space and bus mastering on the secondary side.
    inner.reg_write16(
        inner.regs.spci_cmd,
        pci::CMD_MEM_ENABLE | pci::CMD_BUS_MASTER,
    );
}

fn configure_soc_secondary_side_bars(inner: &Arc<DeviceInner>) {
    match inner.side {
        DeviceSide::Upstream => {
            inner.reg_write64(soc::PBAR2XLAT_OFFSET, b2b::MBAR23_DSD_ADDR);
            inner.reg_write64(soc::PBAR4XLAT_OFFSET, b2b::MBAR4_DSD_ADDR);
            inner.reg_write64(soc::SBAR2BASE_OFFSET, b2b::MBAR23_USD_ADDR);
            inner.reg_write64(soc::SBAR4BASE_OFFSET, b2b::MBAR4_USD_ADDR);
        }
        DeviceSide::Downstream => {
            inner.reg_write64(soc::PBAR2XLAT_OFFSET, b2b::MBAR23_USD_ADDR);
            inner.reg_write64(soc::PBAR4XLAT_OFFSET, b2b::MBAR4_USD_ADDR);
            inner.reg_write64(soc::SBAR2BASE_OFFSET, b2b::MBAR23_DSD_ADDR);
            inner.reg_write64(soc::SBAR4BASE_OFFSET, b2b::MBAR4_DSD_ADDR);
        }
    }
}

fn configure_xeon_secondary_side_bars(inner: &Arc<DeviceInner>) {
    let (mbar01_local, mbar01_peer, mbar23_local, mbar23_peer, mbar4_local, mbar4_peer) =
        match inner.side {
            DeviceSide::Upstream => (
                b2b::MBAR01_USD_ADDR,
                b2b::MBAR01_DSD_ADDR,
                b2b::MBAR23_USD_ADDR,
                b2b::MBAR23_DSD_ADDR,
                b2b::MBAR4_USD_ADDR,
                b2b::MBAR4_DSD_ADDR,
            ),
            DeviceSide::Downstream => (
                b2b::MBAR01_DSD_ADDR,
                b2b::MBAR01_USD_ADDR,
                b2b::MBAR23_DSD_ADDR,
                b2b::MBAR23_USD_ADDR,
                b2b::MBAR4_DSD_ADDR,
                b2b::MBAR4_USD_ADDR,
            ),
        };
    let (mbar5_local, mbar5_peer) = match inner.side {
        DeviceSide::Upstream => (b2b::MBAR5_USD_ADDR, b2b::MBAR5_DSD_ADDR),
        DeviceSide::Downstream => (b2b::MBAR5_DSD_ADDR, b2b::MBAR5_USD_ADDR),
    };

    inner.reg_write64(xeon::PBAR2XLAT_OFFSET, mbar23_peer);
    if inner.features.has(Features::REGS_THRU_MW) {
        // The last window shadows the peer's register aperture.
        inner.reg_write64(xeon::PBAR4XLAT_OFFSET, mbar01_peer);
    } else {
        if inner.features.has(Features::SPLIT_BAR) {
            #[allow(clippy::cast_possible_truncation)]
            {
                inner.reg_write32(xeon::PBAR4XLAT_OFFSET, mbar4_peer as u32);
                inner.reg_write32(xeon::PBAR5XLAT_OFFSET, mbar5_peer as u32);
            }
        } else {
            inner.reg_write64(xeon::PBAR4XLAT_OFFSET, mbar4_peer);
        }
        // B2B_XLAT is a 64-bit register that can only be written 32 bits
        // at a time.
        #[allow(clippy::cast_possible_truncation)]
        {
            inner.reg_write32(xeon::B2B_XLAT_OFFSET_LOW, mbar01_peer as u32);
            inner.reg_write32(xeon::B2B_XLAT_OFFSET_HIGH, (mbar01_peer >> 32) as u32);
        }
    }
    inner.reg_write64(xeon::SBAR0BASE_OFFSET, mbar01_local);
    inner.reg_write64(xeon::SBAR2BASE_OFFSET, mbar23_local);
    if inner.features.has(Features::SPLIT_BAR) {
        #[allow(clippy::cast_possible_truncation)]
        {
            inner.reg_write32(xeon::SBAR4BASE_OFFSET, mbar4_local as u32);
            inner.reg_write32(xeon::SBAR5BASE_OFFSET, mbar5_local as u32);
        }
    } else {
        inner.reg_write64(xeon::SBAR4BASE_OFFSET, mbar4_local);
    }
}

fn teardown_inner(inner: &Arc<DeviceInner>) {
    if inner.detached.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("detaching");
    // The heartbeat and recovery timers arm each other; an in-flight
    // firing that started before the detached flag went up can re-arm the
    // one drained first, so the heartbeat gets a second drain. Firings
    // that start after the flag see it and bail out.
    if let Some(heartbeat) = inner.heartbeat.get() {
        heartbeat.drain();
    }
    if let Some(recovery) = inner.recovery.get() {
        recovery.drain();
    }
    if let Some(heartbeat) = inner.heartbeat.get() {
        heartbeat.drain();
    }
    if inner.family == Family::Xeon {
        link::hw_link_down(inner);
    }
    interrupt::teardown_interrupts(inner);
    bars::unmap_all(inner.bus.as_ref(), &inner.bar_records);
}
