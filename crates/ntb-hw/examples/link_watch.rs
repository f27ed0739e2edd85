//! Attach to an NTB device over VFIO and watch link events.
//!
//! ```bash
//! cargo run --example link_watch -- 0000:02:00.0
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ntb_hw::{NtbDevice, VfioBus};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("ntb_hw=debug")
        .init();

    let address = std::env::args()
        .nth(1)
        .context("usage: link_watch <pci-address>")?;

    let bus = Arc::new(VfioBus::open(&address)?);
    let ntb = NtbDevice::attach(bus)?;

    println!("Attached {:?} NTB at {address}", ntb.family());
    println!("  scratchpads:    {}", ntb.get_max_spads());
    println!("  memory windows: {}", ntb.get_max_mw());
    println!("  callback slots: {}", ntb.get_max_cbs());
    for mw in 0..usize::from(ntb.get_max_mw()) {
        println!(
            "  window {mw}: {:#x} bytes @ {:#x}",
            ntb.get_mw_size(mw).unwrap_or(0),
            ntb.get_mw_pbase(mw).unwrap_or(0)
        );
    }

    ntb.register_event_callback(|event| println!("link event: {event:?}"))?;
    println!(
        "link is {}",
        if ntb.query_link_status() { "up" } else { "down" }
    );

    println!("watching for 60 seconds...");
    std::thread::sleep(Duration::from_secs(60));

    ntb.detach();
    Ok(())
}
