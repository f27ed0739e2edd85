//! Driver behavior exercised end to end against the software NTB model.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ntb_hw::{Features, InterruptVector, LinkEvent, NtbDevice, NtbError, SimBus, Tunables};
use ntb_regs::{ident, pci, soc, xeon};

fn fast_tunables() -> Tunables {
    Tunables {
        heartbeat_interval: Duration::from_millis(10),
        recovery_base: Duration::from_millis(5),
        settle_pause: Duration::from_millis(1),
        ..Tunables::default()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn attach_soc(bus: &Arc<SimBus>) -> NtbDevice {
    NtbDevice::attach_with(Arc::clone(bus) as Arc<dyn ntb_hw::PciBus>, fast_tunables())
        .expect("attach SoC sim")
}

fn attach_xeon(bus: &Arc<SimBus>) -> NtbDevice {
    NtbDevice::attach_with(Arc::clone(bus) as Arc<dyn ntb_hw::PciBus>, fast_tunables())
        .expect("attach Xeon sim")
}

#[test]
fn unknown_device_is_refused() {
    let bus = Arc::new(SimBus::soc().with_device_id(0x1234_8086));
    let err = NtbDevice::attach_with(bus as Arc<dyn ntb_hw::PciBus>, fast_tunables())
        .expect_err("unknown device must not attach");
    assert!(matches!(err, NtbError::UnsupportedConfiguration { .. }));
}

#[test]
fn spad_roundtrip_all_indices() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);

    for idx in 0..usize::from(ntb.get_max_spads()) {
        let value = 0xCAFE_0000 | idx as u32;
        ntb.write_local_spad(idx, value).expect("local write");
        assert_eq!(ntb.read_local_spad(idx).expect("local read"), value);

        ntb.write_remote_spad(idx, !value).expect("remote write");
        assert_eq!(ntb.read_remote_spad(idx).expect("remote read"), !value);
    }

    let oob = usize::from(ntb.get_max_spads());
    assert!(matches!(
        ntb.write_local_spad(oob, 1),
        Err(NtbError::InvalidArgument { .. })
    ));
    assert!(matches!(
        ntb.read_remote_spad(oob),
        Err(NtbError::InvalidArgument { .. })
    ));
}

#[test]
fn remote_spads_route_through_shadow_window_on_xeon() {
    let bus = Arc::new(SimBus::xeon());
    let ntb = attach_xeon(&bus);
    assert!(ntb.has_feature(Features::REGS_THRU_MW));

    ntb.write_remote_spad(3, 0x1234_5678).expect("remote write");
    // The shadow window sits behind the BAR that maps the peer's
    // register aperture, not the local register BAR.
    let shadow = bus.bar_mem(pci::bar_offset(4) as u8);
    assert_eq!(
        shadow.peek(xeon::SHADOW_SPAD_OFFSET + 3 * 4, 4),
        0x1234_5678
    );
    assert_eq!(ntb.read_remote_spad(3).expect("remote read"), 0x1234_5678);
}

#[test]
fn db_registration_validates_index() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);
    let max = usize::from(ntb.get_max_cbs());
    assert_eq!(max, usize::from(soc::MAX_DB_BITS));

    // Out of range.
    assert!(matches!(
        ntb.register_db_callback(max, |_| false),
        Err(NtbError::InvalidArgument { .. })
    ));

    // Occupied.
    ntb.register_db_callback(4, |_| false).expect("first");
    assert!(matches!(
        ntb.register_db_callback(4, |_| false),
        Err(NtbError::InvalidArgument { .. })
    ));

    // The failures left the table usable.
    ntb.register_db_callback(5, |_| false).expect("other slot");
}

#[test]
fn xeon_reserves_the_link_vector_slot() {
    let bus = Arc::new(SimBus::xeon());
    let ntb = attach_xeon(&bus);

    // Four vectors, one held back for the link interrupt.
    assert_eq!(ntb.get_max_cbs(), xeon::MSIX_CNT - 1);
    assert_eq!(
        bus.installed_vectors(),
        vec![
            InterruptVector::Msix(0),
            InterruptVector::Msix(1),
            InterruptVector::Msix(2),
            InterruptVector::Msix(3),
        ]
    );
    assert!(matches!(
        ntb.register_db_callback(usize::from(ntb.get_max_cbs()), |_| false),
        Err(NtbError::InvalidArgument { .. })
    ));
}

#[test]
fn mask_follows_registration_lifecycle() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);
    let regs = bus.bar_mem(pci::bar_offset(0) as u8);

    // Everything starts masked.
    assert_eq!(regs.peek(soc::PDBMSK_OFFSET, 8), !0u64);

    let fired = Arc::new(AtomicU32::new(0));
    let count = Arc::clone(&fired);
    ntb.register_db_callback(2, move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        false
    })
    .expect("register");
    assert_eq!(regs.peek(soc::PDBMSK_OFFSET, 8), !0u64 & !(1 << 2));

    ntb.unregister_db_callback(2);
    assert_eq!(regs.peek(soc::PDBMSK_OFFSET, 8), !0u64);

    // Nothing fires after unregistration returns.
    bus.trigger_msix(2);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn doorbell_dispatch_polls_until_drained() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);
    let regs = bus.bar_mem(pci::bar_offset(0) as u8);

    let calls = Arc::new(AtomicU32::new(0));
    let count = Arc::clone(&calls);
    ntb.register_db_callback(0, move |_| {
        // Three rounds of "more work", then drained.
        count.fetch_add(1, Ordering::SeqCst) < 3
    })
    .expect("register");

    // Peer rings doorbell 0.
    regs.poke(soc::PDOORBELL_OFFSET, 8, 1);
    bus.trigger_msix(0);

    assert!(wait_until(Duration::from_secs(2), || {
        calls.load(Ordering::SeqCst) == 4
    }));
    // Doorbell acknowledged at the hardware level and unmasked again.
    assert_eq!(regs.peek(soc::PDOORBELL_OFFSET, 8), 0);
    assert!(wait_until(Duration::from_secs(1), || {
        regs.peek(soc::PDBMSK_OFFSET, 8) & 1 == 0
    }));
}

#[test]
fn ring_doorbell_sets_single_bit_on_soc() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);
    let regs = bus.bar_mem(pci::bar_offset(0) as u8);

    ntb.ring_doorbell(5);
    ntb.ring_doorbell(0);
    assert_eq!(regs.writes_to(soc::B2B_DOORBELL_OFFSET), vec![1 << 5, 1]);
}

#[test]
fn ring_doorbell_sets_vector_group_on_xeon() {
    let bus = Arc::new(SimBus::xeon());
    let ntb = attach_xeon(&bus);

    ntb.ring_doorbell(1);
    // SNB rings through the shadow window; five bits per vector.
    let shadow = bus.bar_mem(pci::bar_offset(4) as u8);
    assert_eq!(
        shadow.writes_to(xeon::SHADOW_PDOORBELL_OFFSET),
        vec![u64::from(0b11111u16 << 5)]
    );
}

#[test]
fn msix_shortfall_remaps_round_robin() {
    let bus = Arc::new(SimBus::soc().with_msix_grant(8));
    let ntb = attach_soc(&bus);

    // Every doorbell keeps a usable slot...
    assert_eq!(ntb.get_max_cbs(), soc::MAX_DB_BITS);
    // ...spread over the eight granted vectors round-robin.
    let (desired, vectors) = bus.recorded_remap().expect("remap recorded");
    assert_eq!(desired, u32::from(soc::MAX_DB_BITS));
    let expect: Vec<u32> = (0..u32::from(soc::MAX_DB_BITS)).map(|i| i % 8).collect();
    assert_eq!(vectors, expect);
}

#[test]
fn remap_failure_falls_back_to_legacy() {
    let bus = Arc::new(SimBus::soc().with_msix_grant(8).with_remap_failure());
    let ntb = attach_soc(&bus);

    assert_eq!(bus.installed_vectors(), vec![InterruptVector::Legacy]);
    assert!(bus.msix_released() >= 1);
    assert_eq!(ntb.get_max_cbs(), soc::MAX_DB_BITS);
}

#[test]
fn prefer_legacy_tunable_skips_remap() {
    let bus = Arc::new(SimBus::soc().with_msix_grant(8));
    let tunables = Tunables {
        prefer_legacy: true,
        ..fast_tunables()
    };
    let ntb = NtbDevice::attach_with(
        Arc::clone(&bus) as Arc<dyn ntb_hw::PciBus>,
        tunables,
    )
    .expect("attach");

    assert!(bus.recorded_remap().is_none());
    assert_eq!(bus.installed_vectors(), vec![InterruptVector::Legacy]);
    drop(ntb);
}

#[test]
fn force_remap_tunable_exercises_remap_with_full_grant() {
    let bus = Arc::new(SimBus::soc());
    let tunables = Tunables {
        force_remap: true,
        ..fast_tunables()
    };
    let ntb = NtbDevice::attach_with(
        Arc::clone(&bus) as Arc<dyn ntb_hw::PciBus>,
        tunables,
    )
    .expect("attach");

    let (desired, vectors) = bus.recorded_remap().expect("remap recorded");
    assert_eq!(desired, u32::from(soc::MAX_DB_BITS));
    // One vector artificially withheld.
    assert!(vectors.iter().all(|v| *v < u32::from(soc::MAX_DB_BITS) - 1));
    assert_eq!(ntb.get_max_cbs(), soc::MAX_DB_BITS);
}

#[test]
fn legacy_line_demuxes_pending_bits() {
    let bus = Arc::new(SimBus::soc().without_msix());
    let ntb = attach_soc(&bus);
    let regs = bus.bar_mem(pci::bar_offset(0) as u8);

    assert_eq!(bus.installed_vectors(), vec![InterruptVector::Legacy]);
    assert_eq!(ntb.get_max_cbs(), soc::MAX_DB_BITS);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&calls);
    ntb.register_db_callback(1, move |db| {
        seen.lock().unwrap().push(db);
        false
    })
    .expect("register");

    // Bits 0 and 1 pending; only bit 1 has a consumer, both get cleared.
    regs.poke(soc::PDOORBELL_OFFSET, 8, 0b11);
    bus.trigger_legacy();

    assert!(wait_until(Duration::from_secs(2), || {
        calls.lock().unwrap().as_slice() == [1]
    }));
    assert_eq!(regs.peek(soc::PDOORBELL_OFFSET, 8), 0);
}

#[test]
fn duplicate_link_transitions_fire_one_event() {
    let bus = Arc::new(SimBus::xeon());
    let ntb = attach_xeon(&bus);

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    ntb.register_event_callback(move |event| seen.lock().unwrap().push(event))
        .expect("event callback");

    // Config space reports the link active; two link interrupts in a row
    // must produce exactly one Up event.
    bus.trigger_msix(u32::from(xeon::MSIX_CNT) - 1);
    bus.trigger_msix(u32::from(xeon::MSIX_CNT) - 1);

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(events.lock().unwrap().as_slice(), [LinkEvent::Up]);
    assert!(ntb.query_link_status());
}

#[test]
fn second_event_callback_is_refused() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);

    ntb.register_event_callback(|_| {}).expect("first");
    assert!(matches!(
        ntb.register_event_callback(|_| {}),
        Err(NtbError::AlreadyRegistered { .. })
    ));
    ntb.unregister_event_callback();
    ntb.register_event_callback(|_| {}).expect("after clear");
}

#[test]
fn transport_registration_is_exclusive_and_tears_down_callbacks() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);
    let regs = bus.bar_mem(pci::bar_offset(0) as u8);

    let transport: Arc<dyn std::any::Any + Send + Sync> = Arc::new("transport state");
    ntb.register_transport(&transport).expect("register");
    assert!(ntb.find_transport().is_some());
    assert!(matches!(
        ntb.register_transport(&transport),
        Err(NtbError::AlreadyRegistered { .. })
    ));

    ntb.register_db_callback(0, |_| false).expect("db callback");
    ntb.register_event_callback(|_| {}).expect("event callback");

    ntb.unregister_transport();
    assert!(ntb.find_transport().is_none());
    // Doorbell masked again and both registrations gone.
    assert_eq!(regs.peek(soc::PDBMSK_OFFSET, 8), !0u64);
    ntb.register_event_callback(|_| {}).expect("slot is free");
    ntb.register_db_callback(0, |_| false).expect("slot is free");
}

#[test]
fn memory_window_queries_bound_check() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);

    assert_eq!(ntb.get_max_mw(), soc::MAX_MW);
    assert!(ntb.get_mw_pbase(0).is_some());
    assert!(ntb.get_mw_size(1).is_some());
    assert!(ntb.get_mw_pbase(2).is_none());
    assert!(ntb.get_mw_size(2).is_none());

    // Xeon under the through-window erratum loses the last window.
    let bus = Arc::new(SimBus::xeon());
    let ntb = attach_xeon(&bus);
    assert_eq!(ntb.get_max_mw(), xeon::SNB_MAX_MW - 1);
    assert!(ntb.get_mw_size(0).is_some());
    assert!(ntb.get_mw_size(1).is_none());
}

#[test]
fn set_mw_addr_programs_translation_and_ignores_out_of_range() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);
    let regs = bus.bar_mem(pci::bar_offset(0) as u8);

    ntb.set_mw_addr(0, 0x1_2345_6000);
    assert_eq!(regs.peek(soc::SBAR2XLAT_OFFSET, 8), 0x1_2345_6000);
    ntb.set_mw_addr(1, 0x2_0000_0000);
    assert_eq!(regs.peek(soc::SBAR4XLAT_OFFSET, 8), 0x2_0000_0000);

    // Out of range: silently ignored.
    ntb.set_mw_addr(7, 0xDEAD_0000);
}

#[test]
fn detach_releases_each_bar_exactly_once() {
    let bus = Arc::new(SimBus::soc());
    let ntb = attach_soc(&bus);
    assert!(bus.busmaster_enabled());

    ntb.detach();
    let mut released = bus.released_bars();
    released.sort_unstable();
    assert_eq!(
        released,
        vec![pci::bar_offset(0) as u8, pci::bar_offset(2) as u8, pci::bar_offset(4) as u8]
    );
}

#[test]
fn attach_failure_rolls_back_mapped_bars() {
    // IVT carries the BAR-size misreport erratum; reject the resize.
    let ivt = pci::devid(ident::INTEL_VENDOR_ID, ident::device_id::XEON_IVT);
    let bus = SimBus::xeon().with_device_id(ivt).with_resize_failure();
    // Sensible size bits so the erratum path computes a real size.
    bus.config_write_raw(xeon::PBAR23SZ_OFFSET, 1, 17);
    bus.config_write_raw(xeon::PBAR45SZ_OFFSET, 1, 17);
    let bus = Arc::new(bus);

    let err = NtbDevice::attach_with(
        Arc::clone(&bus) as Arc<dyn ntb_hw::PciBus>,
        fast_tunables(),
    )
    .expect_err("resize rejection must fail the attach");
    assert!(matches!(err, NtbError::ResourceUnavailable { .. }));
    // The register window mapped before the failing data window was
    // handed back.
    assert!(bus.released_bars().contains(&(pci::bar_offset(0) as u8)));
}

#[test]
fn write_combining_rejection_is_a_configuration_error() {
    let bus = Arc::new(SimBus::soc().with_wc_failure());
    let err = NtbDevice::attach_with(
        Arc::clone(&bus) as Arc<dyn ntb_hw::PciBus>,
        fast_tunables(),
    )
    .expect_err("WC rejection must fail the attach");
    assert!(matches!(err, NtbError::ResourceConfiguration { .. }));
}

#[test]
fn heartbeat_finds_link_and_recovery_retries_until_match() {
    let bus = Arc::new(SimBus::soc());
    let regs = bus.bar_mem(pci::bar_offset(0) as u8);
    let ntb = attach_soc(&bus);

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    ntb.register_event_callback(move |event| seen.lock().unwrap().push(event))
        .expect("event callback");

    // The heartbeat sees the link up and records width/speed.
    assert!(wait_until(Duration::from_secs(2), || ntb.query_link_status()));

    // Pull the link down with the forced-detect hold asserted and the
    // negotiated values gone.
    regs.poke(soc::NTBCNTL_OFFSET, 4, u64::from(soc::CNTL_LINK_DOWN));
    regs.poke(
        soc::LTSSMSTATEJMP_OFFSET,
        4,
        u64::from(soc::LTSSMSTATEJMP_FORCEDETECT),
    );
    regs.poke(soc::LINK_STATUS_OFFSET, 2, 0);

    assert!(wait_until(Duration::from_secs(2), || !ntb.query_link_status()));

    // Let recovery churn: the restart sequence must have run more than
    // once while the link stayed bad.
    assert!(wait_until(Duration::from_secs(5), || {
        regs.writes_to(soc::MODPHY_PCSREG6).len() >= 4
    }));
    assert!(!ntb.query_link_status());

    // The peer comes back with the last known-good width/speed.
    regs.poke(soc::NTBCNTL_OFFSET, 4, 0);
    regs.poke(soc::LINK_STATUS_OFFSET, 2, u64::from(1u16 << 4 | 1));

    assert!(wait_until(Duration::from_secs(5), || ntb.query_link_status()));
    let seen = events.lock().unwrap();
    assert!(seen.contains(&LinkEvent::Down));
    assert_eq!(seen.last(), Some(&LinkEvent::Up));
}
