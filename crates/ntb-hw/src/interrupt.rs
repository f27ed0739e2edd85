//! Interrupt subsystem: MSI-X allocation with round-robin remap and legacy
//! fallback, the doorbell-callback table, and masked deferred dispatch.
//!
//! Dispatch is level-triggered and edge-coalescing: the interrupt handler
//! acknowledges the doorbell, masks it, and defers the consumer callback
//! to timer context. The callback's progress flag keeps it polling with
//! the doorbell masked until the consumer has drained its work, bounding
//! the interrupt rate under load.

use std::sync::Arc;
use std::time::Duration;

use ntb_regs::{xeon, Family};
use tracing::{debug, warn};

use crate::bus::{InterruptVector, IntrTag, IrqHandler};
use crate::callout::Callout;
use crate::device::{DbCallback, DeviceInner};
use crate::error::{NtbError, Result};
use crate::link;

/// One allocated interrupt resource and its installed handler.
#[derive(Debug)]
pub(crate) struct IntrSlot {
    pub(crate) vector: InterruptVector,
    pub(crate) tag: IntrTag,
}

/// How doorbells reach us after setup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IrqMode {
    #[default]
    Uninit,
    Msix,
    Legacy,
}

#[derive(Debug, Default)]
pub(crate) struct IrqState {
    pub(crate) slots: Vec<IntrSlot>,
    pub(crate) mode: IrqMode,
}

/// One doorbell-callback registration slot.
pub(crate) struct DbSlot {
    pub(crate) handler: Option<DbCallback>,
    /// Permanently excluded from user registration (link-event vector).
    pub(crate) reserved: bool,
    /// Bit manipulated in the doorbell mask register for this slot.
    pub(crate) mask_bit: u8,
    /// Write-one-to-clear pattern acknowledging this slot's doorbell.
    pub(crate) ack_bits: u64,
    /// Deferred-dispatch timer.
    pub(crate) work: Callout,
}

#[derive(Default)]
pub(crate) struct CallbackTable {
    pub(crate) slots: Vec<DbSlot>,
    pub(crate) max_cbs: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    /// One slot per interrupt message.
    Vectored,
    /// One slot per doorbell bit, demuxed from the shared line.
    Legacy,
}

/// Bring up interrupt delivery: MSI-X if the platform provides enough
/// vectors, remapped MSI-X on a shortfall, a single shared legacy line
/// otherwise.
pub(crate) fn setup_interrupts(inner: &Arc<DeviceInner>) -> Result<()> {
    // Mask every doorbell (all but the link interrupt on Xeon); bits are
    // unmasked one at a time as callbacks are registered.
    let keep = match inner.family {
        Family::Xeon => xeon::DB_HW_LINK,
        Family::Soc => 0,
    };
    inner.db_write(inner.regs.ldb_mask, !keep);

    let desired = u32::from(inner.limits.max_db_bits).min(inner.bus.msix_count());
    let mut vectored = None;
    if desired >= 1 {
        match inner.bus.alloc_msix(desired) {
            Ok(mut granted) => {
                if inner.tunables.force_remap && granted == desired {
                    debug!("force_remap: pretending one fewer vector was granted");
                    granted -= 1;
                }
                if granted >= desired {
                    vectored = Some(granted);
                } else {
                    match remap_msix(inner, desired, granted) {
                        Ok(()) => {
                            debug!(desired, granted, "remapped doorbells round-robin");
                            vectored = Some(desired);
                        }
                        Err(e) => {
                            warn!(desired, granted, "MSI-X remap failed: {e}");
                            inner.bus.release_msix();
                        }
                    }
                }
            }
            Err(e) => warn!("MSI-X allocation failed: {e}"),
        }
    }

    // Xeon dedicates the last vector to the link interrupt; with fewer
    // than the full vector set that split does not exist.
    if let Some(num) = vectored {
        if inner.family == Family::Xeon && num < u32::from(inner.limits.msix_cnt) {
            warn!(num, "too few vectors for the link interrupt, using legacy");
            inner.bus.release_msix();
            vectored = None;
        }
    }

    match vectored {
        Some(num) => {
            create_callbacks(inner, num as usize, DispatchMode::Vectored);
            match inner.family {
                Family::Xeon => setup_xeon_msix(inner, num)?,
                Family::Soc => setup_soc_msix(inner, num)?,
            }
            inner.irq.lock().unwrap().mode = IrqMode::Msix;
            Ok(())
        }
        None => {
            // Back on the shared line the only per-callback limit is the
            // number of doorbell bits.
            create_callbacks(
                inner,
                usize::from(inner.limits.max_db_bits),
                DispatchMode::Legacy,
            );
            setup_legacy_interrupt(inner)
        }
    }
}

/// Tear down every installed handler, unregister all callbacks, and
/// release the message vectors.
pub(crate) fn teardown_interrupts(inner: &Arc<DeviceInner>) {
    let (slots, mode) = {
        let mut irq = inner.irq.lock().unwrap();
        (std::mem::take(&mut irq.slots), irq.mode)
    };
    debug!(?mode, count = slots.len(), "tearing down interrupts");
    for slot in slots {
        debug!(vector = ?slot.vector, "removing handler");
        inner.bus.teardown_interrupt(slot.tag);
    }
    free_callbacks(inner);
    inner.bus.release_msix();
    inner.irq.lock().unwrap().mode = IrqMode::Uninit;
}

fn remap_msix(inner: &Arc<DeviceInner>, desired: u32, avail: u32) -> Result<()> {
    if inner.tunables.prefer_legacy {
        return Err(NtbError::resource_unavailable(
            "legacy interrupt preferred over MSI-X remap",
        ));
    }
    if avail == 0 {
        return Err(NtbError::resource_unavailable("no vectors to remap onto"));
    }
    let vectors: Vec<u32> = (0..desired).map(|i| i % avail).collect();
    inner.bus.remap_msix(desired, &vectors)
}

#[allow(clippy::cast_possible_truncation)]
fn slot_bits(inner: &DeviceInner, mode: DispatchMode, idx: usize) -> (u8, u64) {
    match (inner.family, mode) {
        (Family::Xeon, DispatchMode::Vectored) => {
            let bpv = usize::from(inner.bits_per_vector);
            let group = (1u64 << inner.bits_per_vector) - 1;
            ((idx * bpv) as u8, group << (idx * bpv))
        }
        // SoC has one bit per vector either way; in legacy mode every
        // family gets one slot per doorbell bit.
        _ => (idx as u8, 1u64 << idx),
    }
}

fn create_callbacks(inner: &Arc<DeviceInner>, count: usize, mode: DispatchMode) {
    let mut table = inner.callbacks.lock().unwrap();
    table.slots.clear();
    for idx in 0..count {
        let weak = Arc::downgrade(inner);
        let work = inner.wheel.callout(move || {
            if let Some(inner) = weak.upgrade() {
                irq_work(&inner, idx);
            }
        });
        let (mask_bit, ack_bits) = slot_bits(inner, mode, idx);
        table.slots.push(DbSlot {
            handler: None,
            reserved: false,
            mask_bit,
            ack_bits,
            work,
        });
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        table.max_cbs = count as u8;
    }
}

fn free_callbacks(inner: &Arc<DeviceInner>) {
    let count = inner.callbacks.lock().unwrap().slots.len();
    for idx in 0..count {
        unregister_db_callback(inner, idx);
    }
    let mut table = inner.callbacks.lock().unwrap();
    table.slots.clear();
    table.max_cbs = 0;
}

fn setup_xeon_msix(inner: &Arc<DeviceInner>, num_vectors: u32) -> Result<()> {
    for i in 0..num_vectors {
        let weak = Arc::downgrade(inner);
        let handler: IrqHandler = if i == num_vectors - 1 {
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    handle_link_irq(&inner);
                }
            })
        } else {
            let idx = i as usize;
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    handle_db_irq(&inner, idx);
                }
            })
        };
        install(inner, InterruptVector::Msix(i), handler)?;
    }

    // Keep consumers from registering on the link-event slot, from which
    // they would never be called back.
    let mut table = inner.callbacks.lock().unwrap();
    let last = num_vectors as usize - 1;
    table.slots[last].reserved = true;
    #[allow(clippy::cast_possible_truncation)]
    {
        table.max_cbs = last as u8;
    }
    Ok(())
}

fn setup_soc_msix(inner: &Arc<DeviceInner>, num_vectors: u32) -> Result<()> {
    for i in 0..num_vectors {
        let weak = Arc::downgrade(inner);
        let idx = i as usize;
        install(
            inner,
            InterruptVector::Msix(i),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    handle_db_irq(&inner, idx);
                }
            }),
        )?;
    }
    Ok(())
}

fn setup_legacy_interrupt(inner: &Arc<DeviceInner>) -> Result<()> {
    let weak = Arc::downgrade(inner);
    install(
        inner,
        InterruptVector::Legacy,
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                handle_legacy_irq(&inner);
            }
        }),
    )?;
    inner.irq.lock().unwrap().mode = IrqMode::Legacy;
    Ok(())
}

fn install(inner: &Arc<DeviceInner>, vector: InterruptVector, handler: IrqHandler) -> Result<()> {
    let tag = inner.bus.setup_interrupt(vector, handler)?;
    inner
        .irq
        .lock()
        .unwrap()
        .slots
        .push(IntrSlot { vector, tag });
    Ok(())
}

/// Interrupt-context path for one doorbell slot: acknowledge, mask,
/// defer the consumer callback to timer context.
fn handle_db_irq(inner: &Arc<DeviceInner>, idx: usize) {
    let table = inner.callbacks.lock().unwrap();
    let Some(slot) = table.slots.get(idx) else {
        return;
    };
    inner.db_write(inner.regs.ldb, slot.ack_bits);
    if slot.handler.is_some() {
        let mask_bit = slot.mask_bit;
        let work = slot.work.clone();
        drop(table);
        mask_ldb(inner, mask_bit);
        work.reset(Duration::ZERO);
    }
}

/// Xeon link-event vector: read link status, then acknowledge the link
/// bit in the doorbell register.
fn handle_link_irq(inner: &Arc<DeviceInner>) {
    link::check_link_status(inner);
    inner.db_write(inner.regs.ldb, xeon::DB_HW_LINK);
}

/// Shared-line handler: demultiplex every pending doorbell bit low to
/// high, clearing each serviced bit before dispatch.
fn handle_legacy_irq(inner: &Arc<DeviceInner>) {
    let mut ldb = inner.db_read(inner.regs.ldb);

    if inner.family == Family::Xeon && ldb & xeon::DB_HW_LINK != 0 {
        handle_link_irq(inner);
        ldb &= !xeon::DB_HW_LINK;
    }

    while ldb != 0 {
        let idx = ldb.trailing_zeros() as usize;
        ldb &= ldb - 1;
        handle_db_irq(inner, idx);
    }
}

/// Timer-context half of doorbell dispatch. Polls while the consumer
/// reports forward progress; unmasks once the doorbell is drained.
fn irq_work(inner: &Arc<DeviceInner>, idx: usize) {
    let table = inner.callbacks.lock().unwrap();
    let Some(slot) = table.slots.get(idx) else {
        return;
    };
    let Some(handler) = slot.handler.clone() else {
        return;
    };
    let mask_bit = slot.mask_bit;
    let work = slot.work.clone();
    drop(table);

    if (*handler)(idx) {
        work.reset(Duration::ZERO);
    } else {
        unmask_ldb(inner, mask_bit);
    }
}

/// Register a doorbell callback. The mask bit is cleared strictly after
/// the slot is populated so no interrupt is delivered to an empty slot.
pub(crate) fn register_db_callback(
    inner: &Arc<DeviceInner>,
    idx: usize,
    callback: DbCallback,
) -> Result<()> {
    let mut table = inner.callbacks.lock().unwrap();
    if idx >= usize::from(table.max_cbs) {
        return Err(NtbError::invalid_argument(format!(
            "doorbell {idx} out of range (have {})",
            table.max_cbs
        )));
    }
    let slot = &mut table.slots[idx];
    if slot.reserved {
        return Err(NtbError::invalid_argument(format!(
            "doorbell {idx} is reserved"
        )));
    }
    if slot.handler.is_some() {
        return Err(NtbError::invalid_argument(format!(
            "doorbell {idx} already registered"
        )));
    }
    slot.handler = Some(callback);
    let mask_bit = slot.mask_bit;
    drop(table);

    unmask_ldb(inner, mask_bit);
    Ok(())
}

/// Unregister a doorbell callback: mask first, synchronously drain any
/// in-flight deferred dispatch, then clear the slot. No-op for an empty
/// or out-of-range slot.
pub(crate) fn unregister_db_callback(inner: &Arc<DeviceInner>, idx: usize) {
    let table = inner.callbacks.lock().unwrap();
    let Some(slot) = table.slots.get(idx) else {
        return;
    };
    if slot.handler.is_none() {
        return;
    }
    let mask_bit = slot.mask_bit;
    let work = slot.work.clone();
    drop(table);

    mask_ldb(inner, mask_bit);
    work.drain();
    inner.callbacks.lock().unwrap().slots[idx].handler = None;
}

/// Set one bit in the doorbell mask register. The read-modify-write runs
/// from both interrupt and timer context and must stay serialized.
fn mask_ldb(inner: &DeviceInner, bit: u8) {
    let _guard = inner.db_mask_lock.lock().unwrap();
    let mask = inner.db_read(inner.regs.ldb_mask);
    inner.db_write(inner.regs.ldb_mask, mask | (1u64 << bit));
}

/// Clear one bit in the doorbell mask register.
fn unmask_ldb(inner: &DeviceInner, bit: u8) {
    let _guard = inner.db_mask_lock.lock().unwrap();
    let mask = inner.db_read(inner.regs.ldb_mask);
    inner.db_write(inner.regs.ldb_mask, mask & !(1u64 << bit));
}
