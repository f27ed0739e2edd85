//! VFIO implementation of the bus boundary — pure Rust access to real
//! NTB hardware, no kernel module beyond `vfio-pci`.
//!
//! # Requirements
//!
//! 1. IOMMU enabled in BIOS and kernel (`intel_iommu=on`)
//! 2. Device unbound from its native driver and bound to `vfio-pci`
//! 3. User in the `vfio` group or root permissions
//!
//! # Setup commands
//!
//! ```bash
//! echo "0000:02:00.0" > /sys/bus/pci/drivers/ntb/unbind
//! echo "8086 3c0d" > /sys/bus/pci/drivers/vfio-pci/new_id
//! sudo chown $USER /dev/vfio/$IOMMU_GROUP
//! ```
//!
//! VFIO ioctls use `libc`: the ioctl set has too many shapes (int, struct,
//! fd pointer, C string) for a per-variant `rustix::ioctl` impl to pay
//! off; mmap/munmap and pread/pwrite go through `rustix`.

// FFI/ioctl casts are intentional; the VFIO API requires specific types.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustix::io::{pread, pwrite};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, info, warn};

use crate::bus::{InterruptVector, IntrTag, IrqHandler, MappedBar, MmioSpace, PciBus};
use crate::error::{NtbError, Result};

/// VFIO ioctl numbers (from the Linux kernel headers).
///
/// Calculated as `_IO(';', 100 + offset)`, i.e. `(type << 8) | nr`.
mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    const VFIO_TYPE: u8 = b';';
    const VFIO_BASE: u8 = 100;

    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 8);
    pub const VFIO_DEVICE_GET_IRQ_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 9);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;

    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    pub const VFIO_PCI_INTX_IRQ_INDEX: u32 = 0;
    pub const VFIO_PCI_MSIX_IRQ_INDEX: u32 = 2;
    pub const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;

    pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_UNMASK: u32 = 1 << 4;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    count: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    // Followed by `count` eventfd descriptors when DATA_EVENTFD.
}

fn ioctl_err(what: &str) -> NtbError {
    NtbError::resource_unavailable(format!("{what}: {}", std::io::Error::last_os_error()))
}

/// A BAR mapped into this process, with volatile register access.
struct VfioMapping {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is process-wide and owned exclusively; moving it
// between threads does not invalidate it.
unsafe impl Send for VfioMapping {}
// SAFETY: all access is volatile and bounds-checked; MMIO reads are
// side-effect-tolerant by hardware contract and writes race only in the
// ways the hardware already permits.
unsafe impl Sync for VfioMapping {}

impl VfioMapping {
    fn map(device: &File, offset: u64, size: u64) -> Result<Self> {
        // SAFETY: mmap of a VFIO region; offset/size come from (or stay
        // within) the kernel-reported region geometry, and the fd is the
        // open VFIO device. On error mmap returns Err, never a bad ptr.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device.as_fd(),
                offset,
            )
        }
        .map_err(|e| NtbError::resource_unavailable(format!("mmap of BAR failed: {e}")))?;
        Ok(Self {
            ptr: ptr.cast(),
            size: size as usize,
        })
    }

    fn check(&self, offset: u64, width: usize) {
        assert!(
            offset as usize + width <= self.size,
            "register offset out of bounds"
        );
    }
}

impl Drop for VfioMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned, Drop runs once,
        // and no references outlive self.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

impl std::fmt::Debug for VfioMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfioMapping")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

macro_rules! volatile_access {
    ($read:ident, $write:ident, $ty:ty) => {
        fn $read(&self, offset: u64) -> $ty {
            self.check(offset, std::mem::size_of::<$ty>());
            // SAFETY: in bounds per check(), naturally aligned by register
            // layout, and volatile because hardware changes the value.
            unsafe { std::ptr::read_volatile(self.ptr.add(offset as usize).cast::<$ty>()) }
        }
        fn $write(&self, offset: u64, value: $ty) {
            self.check(offset, std::mem::size_of::<$ty>());
            // SAFETY: in bounds per check(), naturally aligned, volatile
            // because the write has hardware side effects.
            unsafe {
                std::ptr::write_volatile(self.ptr.add(offset as usize).cast::<$ty>(), value);
            }
        }
    };
}

impl MmioSpace for VfioMapping {
    volatile_access!(read8, write8, u8);
    volatile_access!(read16, write16, u16);
    volatile_access!(read32, write32, u32);
    volatile_access!(read64, write64, u64);

    fn len(&self) -> u64 {
        self.size as u64
    }

    fn vbase(&self) -> Option<*mut u8> {
        Some(self.ptr)
    }
}

struct DispatchEntry {
    tag: IntrTag,
    fd: RawFd,
    handler: Arc<IrqHandler>,
}

struct DispatchState {
    entries: Mutex<Vec<DispatchEntry>>,
    shutdown: AtomicBool,
}

/// Interrupt delivery thread: polls every registered eventfd and runs the
/// attached handlers. Handlers sharing an eventfd (remapped vectors) all
/// run on a fire, mirroring how shared hardware vectors behave.
struct IrqDispatcher {
    state: Arc<DispatchState>,
    worker: Option<JoinHandle<()>>,
}

impl IrqDispatcher {
    fn new() -> Self {
        let state = Arc::new(DispatchState {
            entries: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name("ntb-irq".into())
            .spawn(move || dispatch_loop(&worker_state))
            .expect("spawn irq dispatch thread");
        Self {
            state,
            worker: Some(worker),
        }
    }

    fn add(&self, tag: IntrTag, fd: RawFd, handler: IrqHandler) {
        self.state.entries.lock().unwrap().push(DispatchEntry {
            tag,
            fd,
            handler: Arc::new(handler),
        });
    }

    fn remove(&self, tag: IntrTag) {
        self.state.entries.lock().unwrap().retain(|e| e.tag != tag);
    }
}

impl Drop for IrqDispatcher {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn dispatch_loop(state: &DispatchState) {
    const POLL_TICK: Duration = Duration::from_millis(100);
    while !state.shutdown.load(Ordering::SeqCst) {
        let fds: Vec<RawFd> = {
            let entries = state.entries.lock().unwrap();
            let mut fds: Vec<RawFd> = entries.iter().map(|e| e.fd).collect();
            fds.sort_unstable();
            fds.dedup();
            fds
        };
        if fds.is_empty() {
            thread::sleep(POLL_TICK);
            continue;
        }
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|fd| libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        // SAFETY: pollfds points at a live, correctly sized array for the
        // duration of the call.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TICK.as_millis() as libc::c_int,
            )
        };
        if rc <= 0 {
            continue;
        }
        for pollfd in &pollfds {
            if pollfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let mut counter = [0u8; 8];
            // SAFETY: reading the 8-byte eventfd counter into a stack
            // buffer of exactly that size; the fd stays open while it is
            // registered.
            unsafe {
                libc::read(pollfd.fd, counter.as_mut_ptr().cast(), 8);
            }
            let handlers: Vec<Arc<IrqHandler>> = {
                let entries = state.entries.lock().unwrap();
                entries
                    .iter()
                    .filter(|e| e.fd == pollfd.fd)
                    .map(|e| Arc::clone(&e.handler))
                    .collect()
            };
            for handler in handlers {
                (*handler)();
            }
        }
    }
}

/// [`PciBus`] over Linux VFIO.
pub struct VfioBus {
    pci_address: String,
    _container: File,
    _group: File,
    device: File,
    device_id: u32,
    config_offset: u64,
    msix_max: u32,
    /// eventfds backing the granted physical vectors.
    msix_fds: Mutex<Vec<RawFd>>,
    /// eventfd servicing each message index (changes on remap).
    msg_fds: Mutex<Vec<RawFd>>,
    intx_fd: Mutex<Option<RawFd>>,
    tag_fds: Mutex<HashMap<IntrTag, ()>>,
    dispatcher: IrqDispatcher,
    next_tag: AtomicU64,
}

impl VfioBus {
    /// Open the device at a PCI address like `0000:02:00.0`, which must
    /// already be bound to `vfio-pci`.
    ///
    /// # Errors
    ///
    /// [`NtbError::ResourceUnavailable`] when any step of the VFIO
    /// container/group/device dance fails.
    pub fn open(pci_address: &str) -> Result<Self> {
        let group = iommu_group(pci_address)?;
        info!(pci_address, group, "opening VFIO device");

        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")?;

        // SAFETY: plain int ioctl on an open fd.
        let version = unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION) };
        if version != ioctls::VFIO_API_VERSION {
            return Err(NtbError::resource_unavailable(format!(
                "VFIO API version mismatch: {version}"
            )));
        }
        // SAFETY: plain int ioctl with an immediate argument.
        let ext = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ext <= 0 {
            return Err(NtbError::resource_unavailable("no Type1v2 IOMMU support"));
        }

        let group_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/vfio/{group}"))?;

        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            ..Default::default()
        };
        // SAFETY: status is a live, correctly initialized _IOWR argument.
        let rc = unsafe {
            libc::ioctl(
                group_file.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS,
                &raw mut status,
            )
        };
        if rc < 0 || status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(NtbError::resource_unavailable(
                "VFIO group is not viable (all devices bound to vfio-pci?)",
            ));
        }

        let container_fd = container.as_raw_fd();
        // SAFETY: the argument is a pointer to the container fd, as the
        // ioctl expects.
        let rc = unsafe {
            libc::ioctl(
                group_file.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER,
                &raw const container_fd,
            )
        };
        if rc < 0 {
            return Err(ioctl_err("VFIO_GROUP_SET_CONTAINER"));
        }
        // SAFETY: plain int ioctl selecting the IOMMU model.
        let rc = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if rc < 0 {
            return Err(ioctl_err("VFIO_SET_IOMMU"));
        }

        let addr = CString::new(pci_address)
            .map_err(|_| NtbError::invalid_argument("PCI address contains NUL"))?;
        // SAFETY: the argument is a NUL-terminated device name; the kernel
        // returns a new fd.
        let device_fd = unsafe {
            libc::ioctl(
                group_file.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD,
                addr.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(ioctl_err("VFIO_GROUP_GET_DEVICE_FD"));
        }
        // SAFETY: device_fd is a fresh fd owned by us from the ioctl above.
        let device = unsafe { std::os::unix::io::FromRawFd::from_raw_fd(device_fd) };

        let config = region_info(&device, ioctls::VFIO_PCI_CONFIG_REGION_INDEX)?;
        let config_offset = config.offset;

        let msix_max = irq_info(&device, ioctls::VFIO_PCI_MSIX_IRQ_INDEX)
            .map(|info| info.count)
            .unwrap_or(0);

        let mut bus = Self {
            pci_address: pci_address.to_string(),
            _container: container,
            _group: group_file,
            device,
            device_id: 0,
            config_offset,
            msix_max,
            msix_fds: Mutex::new(Vec::new()),
            msg_fds: Mutex::new(Vec::new()),
            intx_fd: Mutex::new(None),
            tag_fds: Mutex::new(HashMap::new()),
            dispatcher: IrqDispatcher::new(),
            next_tag: AtomicU64::new(1),
        };
        let vendor = bus.config_read16(0x00);
        let device_id = bus.config_read16(0x02);
        bus.device_id = ntb_regs::pci::devid(vendor, device_id);
        debug!(
            device_id = format_args!("{:#010x}", bus.device_id),
            msix_max, "VFIO device ready"
        );
        Ok(bus)
    }

    fn config_pread(&self, offset: u32, buf: &mut [u8]) {
        if let Err(e) = pread(&self.device, buf, self.config_offset + u64::from(offset)) {
            warn!(offset, "config read failed: {e}");
        }
    }

    fn config_pwrite(&self, offset: u32, buf: &[u8]) {
        if let Err(e) = pwrite(&self.device, buf, self.config_offset + u64::from(offset)) {
            warn!(offset, "config write failed: {e}");
        }
    }

    fn set_irqs_eventfds(&self, index: u32, fds: &[RawFd]) -> Result<()> {
        let mut buf = irq_set_header(
            index,
            ioctls::VFIO_IRQ_SET_DATA_EVENTFD | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            fds.len() as u32,
            fds.len() * std::mem::size_of::<RawFd>(),
        );
        for fd in fds {
            buf.extend_from_slice(&fd.to_ne_bytes());
        }
        // SAFETY: buf holds a correctly sized vfio_irq_set followed by the
        // eventfd array, alive for the duration of the call.
        let rc = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS,
                buf.as_ptr(),
            )
        };
        if rc < 0 {
            return Err(ioctl_err("VFIO_DEVICE_SET_IRQS"));
        }
        Ok(())
    }

    fn disable_irqs(&self, index: u32) {
        let buf = irq_set_header(
            index,
            ioctls::VFIO_IRQ_SET_DATA_NONE | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            0,
            0,
        );
        // SAFETY: buf holds a correctly sized vfio_irq_set with no payload.
        unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS,
                buf.as_ptr(),
            );
        }
    }
}

fn irq_set_header(index: u32, flags: u32, count: u32, payload: usize) -> Vec<u8> {
    let header = VfioIrqSet {
        argsz: (std::mem::size_of::<VfioIrqSet>() + payload) as u32,
        flags,
        index,
        start: 0,
        count,
    };
    let mut buf = Vec::with_capacity(std::mem::size_of::<VfioIrqSet>() + payload);
    // SAFETY: VfioIrqSet is repr(C) plain-old-data; viewing it as bytes is
    // well defined.
    buf.extend_from_slice(unsafe {
        std::slice::from_raw_parts(
            (&raw const header).cast::<u8>(),
            std::mem::size_of::<VfioIrqSet>(),
        )
    });
    buf
}

fn region_info(device: &File, index: u32) -> Result<VfioRegionInfo> {
    let mut info = VfioRegionInfo {
        argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
        index,
        ..Default::default()
    };
    // SAFETY: info is a live, correctly initialized _IOWR argument.
    let rc = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            ioctls::VFIO_DEVICE_GET_REGION_INFO,
            &raw mut info,
        )
    };
    if rc < 0 {
        return Err(ioctl_err("VFIO_DEVICE_GET_REGION_INFO"));
    }
    Ok(info)
}

fn irq_info(device: &File, index: u32) -> Result<VfioIrqInfo> {
    let mut info = VfioIrqInfo {
        argsz: std::mem::size_of::<VfioIrqInfo>() as u32,
        index,
        ..Default::default()
    };
    // SAFETY: info is a live, correctly initialized _IOWR argument.
    let rc = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            ioctls::VFIO_DEVICE_GET_IRQ_INFO,
            &raw mut info,
        )
    };
    if rc < 0 {
        return Err(ioctl_err("VFIO_DEVICE_GET_IRQ_INFO"));
    }
    Ok(info)
}

fn iommu_group(pci_address: &str) -> Result<String> {
    let link = Path::new("/sys/bus/pci/devices")
        .join(pci_address)
        .join("iommu_group");
    let target = std::fs::read_link(&link).map_err(|e| {
        NtbError::resource_unavailable(format!(
            "no IOMMU group for {pci_address} (IOMMU enabled?): {e}"
        ))
    })?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| NtbError::resource_unavailable("malformed iommu_group link"))
}

fn make_eventfd() -> Result<RawFd> {
    // SAFETY: eventfd takes no pointers; a negative return is an error.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(ioctl_err("eventfd"));
    }
    Ok(fd)
}

impl std::fmt::Debug for VfioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfioBus")
            .field("pci_address", &self.pci_address)
            .field("device_id", &format_args!("{:#010x}", self.device_id))
            .field("msix_max", &self.msix_max)
            .finish_non_exhaustive()
    }
}

impl PciBus for VfioBus {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn config_read8(&self, offset: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.config_pread(offset, &mut buf);
        buf[0]
    }

    fn config_read16(&self, offset: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.config_pread(offset, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn config_read32(&self, offset: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.config_pread(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn config_write8(&self, offset: u32, value: u8) {
        self.config_pwrite(offset, &[value]);
    }

    fn config_write16(&self, offset: u32, value: u16) {
        self.config_pwrite(offset, &value.to_le_bytes());
    }

    fn config_write32(&self, offset: u32, value: u32) {
        self.config_pwrite(offset, &value.to_le_bytes());
    }

    fn map_bar(&self, resource_id: u8) -> Result<MappedBar> {
        let bar_index = u32::from((resource_id - 0x10) / 4);
        let info = region_info(&self.device, bar_index)?;
        if info.size == 0 {
            return Err(NtbError::resource_unavailable(format!(
                "BAR {bar_index} has no aperture"
            )));
        }
        let mapping = VfioMapping::map(&self.device, info.offset, info.size)?;

        let low = self.config_read32(u32::from(resource_id));
        let is_64bit = low & 0x4 != 0;
        let mut pbase = u64::from(low & !0xF);
        if is_64bit {
            pbase |= u64::from(self.config_read32(u32::from(resource_id) + 4)) << 32;
        }

        debug!(
            bar_index,
            size = format_args!("{:#x}", info.size),
            pbase = format_args!("{pbase:#x}"),
            "mapped BAR"
        );
        Ok(MappedBar {
            resource_id,
            pbase,
            size: info.size,
            space: Arc::new(mapping),
        })
    }

    fn resize_bar(&self, bar: &mut MappedBar, size: u64) -> Result<()> {
        let bar_index = u32::from((bar.resource_id - 0x10) / 4);
        let info = region_info(&self.device, bar_index)?;
        // The platform accepts the resize iff it reserved enough address
        // space behind the region; the mmap answers that for us.
        let mapping = VfioMapping::map(&self.device, info.offset, size)?;
        bar.space = Arc::new(mapping);
        bar.size = size;
        Ok(())
    }

    fn set_write_combining(&self, bar: &mut MappedBar) -> Result<()> {
        let bar_index = (bar.resource_id - 0x10) / 4;
        let path = format!(
            "/sys/bus/pci/devices/{}/resource{bar_index}_wc",
            self.pci_address
        );
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                NtbError::resource_configuration(format!(
                    "no write-combining mapping at {path}: {e}"
                ))
            })?;
        let mapping = VfioMapping::map(&file, 0, bar.size).map_err(|e| {
            NtbError::resource_configuration(format!("write-combining mmap failed: {e}"))
        })?;
        bar.space = Arc::new(mapping);
        Ok(())
    }

    fn release_bar(&self, bar: MappedBar) {
        drop(bar);
    }

    fn msix_count(&self) -> u32 {
        self.msix_max
    }

    fn alloc_msix(&self, count: u32) -> Result<u32> {
        if self.msix_max == 0 {
            return Err(NtbError::resource_unavailable("device has no MSI-X"));
        }
        let granted = count.min(self.msix_max);
        let mut fds = Vec::with_capacity(granted as usize);
        for _ in 0..granted {
            fds.push(make_eventfd()?);
        }
        self.set_irqs_eventfds(ioctls::VFIO_PCI_MSIX_IRQ_INDEX, &fds)?;
        *self.msg_fds.lock().unwrap() = fds.clone();
        *self.msix_fds.lock().unwrap() = fds;
        Ok(granted)
    }

    fn remap_msix(&self, desired: u32, vectors: &[u32]) -> Result<()> {
        let phys = self.msix_fds.lock().unwrap().clone();
        let mapped: Vec<RawFd> = (0..desired as usize)
            .map(|i| phys[vectors[i] as usize])
            .collect();
        self.set_irqs_eventfds(ioctls::VFIO_PCI_MSIX_IRQ_INDEX, &mapped)?;
        *self.msg_fds.lock().unwrap() = mapped;
        Ok(())
    }

    fn release_msix(&self) {
        self.disable_irqs(ioctls::VFIO_PCI_MSIX_IRQ_INDEX);
        self.msg_fds.lock().unwrap().clear();
        for fd in self.msix_fds.lock().unwrap().drain(..) {
            // SAFETY: fd came from eventfd() and is no longer registered
            // anywhere.
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn setup_interrupt(&self, vector: InterruptVector, handler: IrqHandler) -> Result<IntrTag> {
        let tag = IntrTag(self.next_tag.fetch_add(1, Ordering::SeqCst));
        match vector {
            InterruptVector::Msix(message) => {
                let fd = self
                    .msg_fds
                    .lock()
                    .unwrap()
                    .get(message as usize)
                    .copied()
                    .ok_or_else(|| {
                        NtbError::resource_unavailable(format!(
                            "no eventfd for message {message}"
                        ))
                    })?;
                self.dispatcher.add(tag, fd, handler);
            }
            InterruptVector::Legacy => {
                let fd = make_eventfd()?;
                self.set_irqs_eventfds(ioctls::VFIO_PCI_INTX_IRQ_INDEX, &[fd])?;
                *self.intx_fd.lock().unwrap() = Some(fd);
                // INTx auto-masks on delivery; unmask after every run.
                let unmask = IntxUnmask::capture(self);
                self.dispatcher.add(
                    tag,
                    fd,
                    Box::new(move || {
                        handler();
                        unmask.unmask();
                    }),
                );
            }
        }
        self.tag_fds.lock().unwrap().insert(tag, ());
        Ok(tag)
    }

    fn teardown_interrupt(&self, tag: IntrTag) {
        self.dispatcher.remove(tag);
    }

    fn enable_busmaster(&self) {
        let cmd = self.config_read16(0x04);
        self.config_write16(
            0x04,
            cmd | ntb_regs::pci::CMD_MEM_ENABLE | ntb_regs::pci::CMD_BUS_MASTER,
        );
    }
}

impl Drop for VfioBus {
    fn drop(&mut self) {
        self.release_msix();
        if let Some(fd) = self.intx_fd.lock().unwrap().take() {
            self.disable_irqs(ioctls::VFIO_PCI_INTX_IRQ_INDEX);
            // SAFETY: fd came from eventfd() and the dispatcher thread is
            // stopped by IrqDispatcher::drop before the File fds close.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Small helper carrying the device fd for the INTx unmask dance without
/// borrowing the whole bus into the handler closure.
struct IntxUnmask {
    device_fd: RawFd,
}

impl IntxUnmask {
    fn capture(bus: &VfioBus) -> Self {
        Self {
            device_fd: bus.device.as_raw_fd(),
        }
    }

    fn unmask(&self) {
        let buf = irq_set_header(
            ioctls::VFIO_PCI_INTX_IRQ_INDEX,
            ioctls::VFIO_IRQ_SET_DATA_NONE | ioctls::VFIO_IRQ_SET_ACTION_UNMASK,
            1,
            0,
        );
        // SAFETY: buf holds a correctly sized vfio_irq_set with no payload.
        unsafe {
            libc::ioctl(self.device_fd, ioctls::VFIO_DEVICE_SET_IRQS, buf.as_ptr());
        }
    }
}
