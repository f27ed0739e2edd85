//! BAR/resource manager.
//!
//! Maps up to four apertures with one of two strategies: a plain register
//! window, or a data memory window that additionally gets the BAR-size
//! misreport workaround and a write-combining mapping. Strategy selection
//! is driven by family features rather than hard-coded per index, because
//! the register-through-window erratum turns data apertures into register
//! proxies.

use std::sync::Mutex;

use ntb_regs::{pci, xeon, Features};
use tracing::{debug, error};

use crate::bus::{MappedBar, PciBus};
use crate::error::{NtbError, Result};

/// Register aperture, always BAR index 0.
pub(crate) const NTB_CONFIG_BAR: usize = 0;
/// Most apertures any supported part exposes.
pub(crate) const MAX_BARS: usize = 4;

/// Memory-window number to BAR index (window 0 is BAR index 1).
pub(crate) const fn mw_to_bar(mw: usize) -> usize {
    mw + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapStrategy {
    RegisterWindow,
    DataWindow,
}

/// Map every aperture the device needs, in BAR-index order.
///
/// On failure everything already mapped is released before returning.
pub(crate) fn map_pci_bars(
    bus: &dyn PciBus,
    features: Features,
) -> Result<[Option<MappedBar>; MAX_BARS]> {
    let split = features.has(Features::SPLIT_BAR);
    let thru_mw = features.has(Features::REGS_THRU_MW);

    let mut plan: Vec<(u8, MapStrategy)> = vec![
        (pci::bar_offset(0) as u8, MapStrategy::RegisterWindow),
        (pci::bar_offset(2) as u8, MapStrategy::DataWindow),
        (
            pci::bar_offset(4) as u8,
            if thru_mw && !split {
                MapStrategy::RegisterWindow
            } else {
                MapStrategy::DataWindow
            },
        ),
    ];
    if split {
        plan.push((
            pci::bar_offset(5) as u8,
            if thru_mw {
                MapStrategy::RegisterWindow
            } else {
                MapStrategy::DataWindow
            },
        ));
    }

    let mut bars: [Option<MappedBar>; MAX_BARS] = [None, None, None, None];
    for (index, (resource_id, strategy)) in plan.into_iter().enumerate() {
        match map_one(bus, features, resource_id, strategy) {
            Ok(bar) => {
                debug!(
                    index,
                    resource_id,
                    size = format_args!("{:#x}", bar.size),
                    pbase = format_args!("{:#x}", bar.pbase),
                    "mapped BAR"
                );
                bars[index] = Some(bar);
            }
            Err(e) => {
                error!(index, resource_id, "unable to map BAR: {e}");
                release_partial(bus, bars);
                return Err(e);
            }
        }
    }
    Ok(bars)
}

fn map_one(
    bus: &dyn PciBus,
    features: Features,
    resource_id: u8,
    strategy: MapStrategy,
) -> Result<MappedBar> {
    match strategy {
        MapStrategy::RegisterWindow => map_register_window(bus, resource_id),
        MapStrategy::DataWindow => map_data_window(bus, features, resource_id),
    }
}

fn map_register_window(bus: &dyn PciBus, resource_id: u8) -> Result<MappedBar> {
    bus.map_bar(resource_id)
}

fn map_data_window(bus: &dyn PciBus, features: Features, resource_id: u8) -> Result<MappedBar> {
    let mut bar = bus.map_bar(resource_id)?;

    // The hardware misreports data-window BAR sizes on parts with the
    // size erratum. Read the size it should have been configured to from
    // the vendor config register and resize the host resource to match;
    // the platform firmware is required to have reserved enough address
    // space for this to succeed.
    if features.has(Features::BAR_SIZE_4K) {
        let size_reg = if resource_id == pci::bar_offset(2) as u8 {
            xeon::PBAR23SZ_OFFSET
        } else {
            xeon::PBAR45SZ_OFFSET
        };
        let size_bits = bus.config_read8(size_reg);
        let true_size = 1u64 << size_bits;
        if let Err(e) = bus.resize_bar(&mut bar, true_size) {
            error!(resource_id, size_bits, "unable to resize BAR: {e}");
            bus.release_bar(bar);
            return Err(NtbError::resource_unavailable(format!(
                "BAR at {resource_id:#x} cannot be resized to {true_size:#x}"
            )));
        }
    }

    // Data windows carry bulk transfers; map them write-combining.
    if let Err(e) = bus.set_write_combining(&mut bar) {
        error!(resource_id, "unable to mark BAR write-combining: {e}");
        bus.release_bar(bar);
        return Err(NtbError::resource_configuration(format!(
            "write-combining rejected for BAR at {resource_id:#x}"
        )));
    }

    Ok(bar)
}

fn release_partial(bus: &dyn PciBus, bars: [Option<MappedBar>; MAX_BARS]) {
    for bar in bars.into_iter().flatten() {
        bus.release_bar(bar);
    }
}

/// Release every mapped aperture. Idempotent: slots already released are
/// skipped, and a second call finds nothing to do.
pub(crate) fn unmap_all(bus: &dyn PciBus, records: &Mutex<[Option<MappedBar>; MAX_BARS]>) {
    let mut records = records.lock().unwrap();
    for slot in records.iter_mut() {
        if let Some(bar) = slot.take() {
            bus.release_bar(bar);
        }
    }
}
