//! This file contains all of the logic pertaining to the kernel coverage
//! buffer: opening the coverage device, mapping its buffer, arming it in
//! either PC or comparison trace mode, and resetting/harvesting the entry
//! count around every program execution.
//!
//! One `Cover` belongs to exactly one execution unit. The lifecycle is
//! open -> map -> enable -> (reset -> execute -> collect)*, and the buffer
//! capacity is fixed when the device is opened.
use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::err::ExecErr;
use crate::misc::page_size;
use crate::prompt_warn;

/// Bytes the device reserves per configured entry
pub const KCOV_ENTRY_SIZE: usize = 8;

// Device facts for Linux KCOV
#[cfg(target_os = "linux")]
mod sys {
    pub const DEFAULT_DEVICE: &str = "/sys/kernel/debug/kcov";

    // _IOR('c', 1, unsigned long)
    pub const SET_BUFSIZE: u64 = 0x8008_6301;

    // _IO('c', 100)
    pub const ENABLE: u64 = 0x6364;

    pub const MODE_TRACE_PC: libc::c_ulong = 0;
    pub const MODE_TRACE_CMP: libc::c_ulong = 1;

    pub type ModeArg = libc::c_ulong;
}

// Device facts for the BSD family, the mode travels as an int
#[cfg(not(target_os = "linux"))]
mod sys {
    pub const DEFAULT_DEVICE: &str = "/dev/kcov";

    // _IOWINT('c', 4)
    pub const SET_BUFSIZE: u64 = 0x2004_6304;

    // _IOWINT('c', 2)
    pub const ENABLE: u64 = 0x2004_6302;

    pub const MODE_TRACE_PC: libc::c_int = 0;
    pub const MODE_TRACE_CMP: libc::c_int = 1;

    pub type ModeArg = libc::c_int;
}

pub use sys::DEFAULT_DEVICE;

/// What the device records while armed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoverMode {
    TracePc,
    TraceCmp,
}

impl CoverMode {
    pub fn from_comps(collect_comps: bool) -> Self {
        if collect_comps {
            CoverMode::TraceCmp
        } else {
            CoverMode::TracePc
        }
    }

    fn arg(&self) -> sys::ModeArg {
        match self {
            CoverMode::TracePc => sys::MODE_TRACE_PC,
            CoverMode::TraceCmp => sys::MODE_TRACE_CMP,
        }
    }
}

/// Width of one trace entry (and the header cell) for the target kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryWidth {
    U32,
    U64,
}

impl EntryWidth {
    pub fn from_kernel(is_kernel_64_bit: bool) -> Self {
        if is_kernel_64_bit {
            EntryWidth::U64
        } else {
            EntryWidth::U32
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            EntryWidth::U32 => std::mem::size_of::<u32>(),
            EntryWidth::U64 => std::mem::size_of::<u64>(),
        }
    }
}

/// Whether the trailing part of the buffer can be made read-only between
/// collection windows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    PageGuard,
    Unsupported,
}

impl Protection {
    // CheriBSD mappings can't be narrowed this way yet, the trace stays
    // writable by the target program there
    pub fn platform() -> Self {
        if cfg!(target_os = "freebsd") {
            Protection::Unsupported
        } else {
            Protection::PageGuard
        }
    }
}

/// The narrow set of control operations the lifecycle needs from a coverage
/// device. Real kernels and in-memory fakes both implement it
pub trait CoverDevice {
    /// Descriptor the device is presented on
    fn fd(&self) -> RawFd;

    /// Configure the trace capacity in entries
    fn set_buffer_size(&mut self, entries: usize) -> Result<(), ExecErr>;

    /// Arm collection in the given mode
    fn enable(&mut self, mode: CoverMode) -> Result<(), ExecErr>;

    /// Shared read/write mapping over the device buffer
    fn map(&mut self, len: usize) -> Result<*mut u8, ExecErr>;
}

/// A kernel coverage character device sitting on a fixed descriptor
#[derive(Debug)]
pub struct KcovDevice {
    fd: RawFd,
}

impl KcovDevice {
    /// Open `path` and move it onto `target_fd` so every execution unit shows
    /// up on a predictable descriptor
    pub fn open(path: &str, target_fd: RawFd) -> Result<Self, ExecErr> {
        let Ok(c_path) = CString::new(path) else {
            return Err(ExecErr::from(&format!("Invalid coverage device path '{}'", path)));
        };

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd == -1 {
            return Err(ExecErr::from_os(&format!("open of {} failed", path)));
        }

        if fd != target_fd {
            if unsafe { libc::dup2(fd, target_fd) } < 0 {
                let err = ExecErr::from_os(&format!(
                    "failed to dup cover fd, from={}, to={}", fd, target_fd));
                unsafe { libc::close(fd) };
                return Err(err);
            }

            unsafe { libc::close(fd) };
        }

        Ok(KcovDevice { fd: target_fd })
    }
}

impl CoverDevice for KcovDevice {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn set_buffer_size(&mut self, entries: usize) -> Result<(), ExecErr> {
        let result = unsafe {
            libc::ioctl(self.fd, sys::SET_BUFSIZE as _, entries as sys::ModeArg)
        };

        if result != 0 {
            return Err(ExecErr::from_os(&format!(
                "ioctl init trace write failed, fd={}, entries={}", self.fd, entries)));
        }

        Ok(())
    }

    fn enable(&mut self, mode: CoverMode) -> Result<(), ExecErr> {
        let result = unsafe { libc::ioctl(self.fd, sys::ENABLE as _, mode.arg()) };
        if result != 0 {
            return Err(ExecErr::from_os(&format!(
                "cover enable write trace failed, mode={:?}", mode)));
        }

        Ok(())
    }

    fn map(&mut self, len: usize) -> Result<*mut u8, ExecErr> {
        let result = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0
            )
        };

        if result == libc::MAP_FAILED {
            return Err(ExecErr::from_os(&format!(
                "cover mmap failed, fd={}, len=0x{:X}", self.fd, len)));
        }

        Ok(result as *mut u8)
    }
}

impl Drop for KcovDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// Where a buffer is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoverState {
    Opened,
    Mapped,
    Armed,
}

/// One execution unit's coverage buffer
#[derive(Debug)]
pub struct Cover<D: CoverDevice> {
    device: D,
    state: CoverState,
    width: EntryWidth,
    protection: Protection,
    mode: Option<CoverMode>,
    mmap_alloc_size: usize, // Fixed at open time
    data: *mut u8,          // Start of the mapping, null until mapped
    data_end: *mut u8,      // One past the end of the mapping
    data_offset: usize,     // Where entries start, right after the header
    pc_offset: u64,         // Added to every decoded PC
    size: usize,            // Entry count from the last collect
}

impl<D: CoverDevice> Cover<D> {
    /// Take ownership of an opened device and configure its capacity
    pub fn open(
        mut device: D,
        cover_size: usize,
        width: EntryWidth,
        _collect_extra: bool,
    ) -> Result<Self, ExecErr> {
        // No remote coverage on these kernels, extra collection is ignored
        let mmap_alloc_size = cover_size.checked_mul(KCOV_ENTRY_SIZE).ok_or_else(|| {
            ExecErr::from(&format!("cover size {} entries overflows the mapping size", cover_size))
        })?;
        device.set_buffer_size(cover_size)?;

        Ok(Cover {
            device,
            state: CoverState::Opened,
            width,
            protection: Protection::platform(),
            mode: None,
            mmap_alloc_size,
            data: std::ptr::null_mut(),
            data_end: std::ptr::null_mut(),
            data_offset: 0,
            pc_offset: 0,
            size: 0,
        })
    }

    /// Map the device buffer, there can only ever be one mapping
    pub fn map(&mut self) -> Result<(), ExecErr> {
        if !self.data.is_null() {
            return Err(ExecErr::from(
                "cover mmap invoked on an already mapped buffer"));
        }

        let data = self.device.map(self.mmap_alloc_size)?;
        self.data = data;
        self.data_end = unsafe { data.add(self.mmap_alloc_size) };
        self.data_offset = self.width.bytes();
        self.pc_offset = 0;
        self.state = CoverState::Mapped;

        if self.protection == Protection::Unsupported {
            prompt_warn!("Trace protection unavailable, fd={} trace is target-writable",
                self.device.fd());
        }

        Ok(())
    }

    // Everything past the first page goes read-only
    pub fn protect(&mut self) -> Result<(), ExecErr> {
        self.ensure_mapped("protect")?;
        if self.protection == Protection::Unsupported {
            return Ok(());
        }

        let page = page_size();
        if self.mmap_alloc_size <= page {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.data.add(page) as *mut libc::c_void,
                self.mmap_alloc_size - page,
                libc::PROT_READ
            )
        };

        if result == -1 {
            return Err(ExecErr::from_os("cover mprotect to read-only failed"));
        }

        Ok(())
    }

    pub fn unprotect(&mut self) -> Result<(), ExecErr> {
        self.ensure_mapped("unprotect")?;
        if self.protection == Protection::Unsupported {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.data as *mut libc::c_void,
                self.mmap_alloc_size,
                libc::PROT_READ | libc::PROT_WRITE
            )
        };

        if result == -1 {
            return Err(ExecErr::from_os("cover mprotect to read-write failed"));
        }

        Ok(())
    }

    /// Arm the device, the mode stays for the rest of the buffer's life
    pub fn enable(&mut self, collect_comps: bool, _collect_extra: bool) -> Result<(), ExecErr> {
        match self.state {
            CoverState::Opened => {
                return Err(ExecErr::from("cover enable invoked before mmap"));
            }
            CoverState::Armed => {
                return Err(ExecErr::from(&format!(
                    "cover enable invoked on a buffer already armed in {:?} mode",
                    self.mode)));
            }
            CoverState::Mapped => (),
        }

        let mode = CoverMode::from_comps(collect_comps);
        self.device.enable(mode)?;
        self.mode = Some(mode);
        self.state = CoverState::Armed;

        Ok(())
    }

    /// Zero the header count, call before every execution whose trace has to
    /// be kept apart from the previous one
    pub fn reset(&mut self) -> Result<(), ExecErr> {
        self.ensure_mapped("reset")?;
        unsafe {
            match self.width {
                EntryWidth::U64 => std::ptr::write_volatile(self.data as *mut u64, 0),
                EntryWidth::U32 => std::ptr::write_volatile(self.data as *mut u32, 0),
            }
        }

        Ok(())
    }

    /// Latch the header count into `size` and return it
    pub fn collect(&mut self) -> Result<usize, ExecErr> {
        self.ensure_mapped("collect")?;
        self.size = unsafe {
            match self.width {
                EntryWidth::U64 => std::ptr::read_volatile(self.data as *const u64) as usize,
                EntryWidth::U32 => std::ptr::read_volatile(self.data as *const u32) as usize,
            }
        };

        Ok(self.size)
    }

    fn ensure_mapped(&self, op: &str) -> Result<(), ExecErr> {
        if self.data.is_null() {
            return Err(ExecErr::from(&format!(
                "cover {} invoked on an unmapped buffer", op)));
        }

        Ok(())
    }

    /// Read-only view of the whole mapping, `None` until mapped
    pub fn data(&self) -> Option<&[u8]> {
        if self.data.is_null() {
            return None;
        }

        let len = self.data_end as usize - self.data as usize;
        Some(unsafe { std::slice::from_raw_parts(self.data, len) })
    }

    pub fn data_end(&self) -> *const u8 {
        self.data_end
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn pc_offset(&self) -> u64 {
        self.pc_offset
    }

    pub fn width(&self) -> EntryWidth {
        self.width
    }

    pub fn mode(&self) -> Option<CoverMode> {
        self.mode
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_armed(&self) -> bool {
        self.state == CoverState::Armed
    }

    pub fn mmap_alloc_size(&self) -> usize {
        self.mmap_alloc_size
    }

    pub fn fd(&self) -> RawFd {
        self.device.fd()
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }
}

impl<D: CoverDevice> Drop for Cover<D> {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe { libc::munmap(self.data as *mut libc::c_void, self.mmap_alloc_size) };
        }
    }
}

/// Open `device` onto `cover_fd` and configure it, ready to be mapped
pub fn open_kcov(
    device: &str,
    cover_fd: RawFd,
    cover_size: usize,
    width: EntryWidth,
    collect_extra: bool,
) -> Result<Cover<KcovDevice>, ExecErr> {
    let kcov = KcovDevice::open(device, cover_fd)?;
    Cover::open(kcov, cover_size, width, collect_extra)
}

/// In-memory coverage device. The "kernel" side is per thread, like a real
/// kcov handle is per task: whatever thread armed the device is the one
/// whose traced calls land in its buffer
#[cfg(test)]
pub mod fake {
    use std::cell::Cell;
    use std::os::unix::io::RawFd;

    use super::{CoverDevice, CoverMode, EntryWidth};
    use crate::err::ExecErr;

    // Words in one comparison record: type, arg1, arg2, pc
    pub const CMP_RECORD_WORDS: usize = 4;

    #[derive(Clone, Copy)]
    struct Armed {
        area: *mut u8,
        len: usize,
        width: EntryWidth,
        mode: CoverMode,
    }

    thread_local! {
        static ARMED: Cell<Option<Armed>> = const { Cell::new(None) };
    }

    #[derive(Debug)]
    pub struct FakeDevice {
        fd: RawFd,
        width: EntryWidth,
        pub entries: Option<usize>,
        pub reject: Option<CoverMode>,
        area: *mut u8,
        len: usize,
    }

    impl FakeDevice {
        pub fn new(fd: RawFd, width: EntryWidth) -> Self {
            FakeDevice {
                fd,
                width,
                entries: None,
                reject: None,
                area: std::ptr::null_mut(),
                len: 0,
            }
        }
    }

    impl CoverDevice for FakeDevice {
        fn fd(&self) -> RawFd {
            self.fd
        }

        fn set_buffer_size(&mut self, entries: usize) -> Result<(), ExecErr> {
            if entries < 2 {
                return Err(ExecErr::from("fake device rejects tiny buffers"));
            }

            self.entries = Some(entries);
            Ok(())
        }

        fn enable(&mut self, mode: CoverMode) -> Result<(), ExecErr> {
            if self.reject == Some(mode) || self.area.is_null() {
                return Err(ExecErr::from(&format!("fake device rejected {:?}", mode)));
            }

            ARMED.with(|armed| armed.set(Some(Armed {
                area: self.area,
                len: self.len,
                width: self.width,
                mode,
            })));
            Ok(())
        }

        fn map(&mut self, len: usize) -> Result<*mut u8, ExecErr> {
            let result = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANON,
                    -1,
                    0
                )
            };

            if result == libc::MAP_FAILED {
                return Err(ExecErr::from_os("fake device mmap failed"));
            }

            self.area = result as *mut u8;
            self.len = len;
            Ok(self.area)
        }
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            // The buffer is unmapped by its owner, just stop tracing into it
            ARMED.with(|armed| {
                if let Some(current) = armed.get() {
                    if current.area == self.area {
                        armed.set(None);
                    }
                }
            });
        }
    }

    fn read_word(area: *mut u8, width: EntryWidth, idx: usize) -> u64 {
        unsafe {
            match width {
                EntryWidth::U64 => (area as *const u64).add(idx).read_volatile(),
                EntryWidth::U32 => (area as *const u32).add(idx).read_volatile() as u64,
            }
        }
    }

    fn write_word(area: *mut u8, width: EntryWidth, idx: usize, value: u64) {
        unsafe {
            match width {
                EntryWidth::U64 => (area as *mut u64).add(idx).write_volatile(value),
                EntryWidth::U32 => (area as *mut u32).add(idx).write_volatile(value as u32),
            }
        }
    }

    /// What the instrumentation does when a traced PC executes
    pub fn trace_pc(pc: u64) {
        let Some(armed) = ARMED.with(|armed| armed.get()) else { return };
        if armed.mode != CoverMode::TracePc {
            return;
        }

        let count = read_word(armed.area, armed.width, 0) as usize;
        let slots = armed.len / armed.width.bytes();
        if count + 1 >= slots {
            return;
        }

        write_word(armed.area, armed.width, count + 1, pc);
        write_word(armed.area, armed.width, 0, count as u64 + 1);
    }

    /// What the instrumentation does when a traced comparison executes.
    /// Comparison records are always 64-bit words
    pub fn trace_cmp(kind: u64, arg1: u64, arg2: u64, pc: u64) {
        let Some(armed) = ARMED.with(|armed| armed.get()) else { return };
        if armed.mode != CoverMode::TraceCmp {
            return;
        }

        let count = read_word(armed.area, EntryWidth::U64, 0) as usize;
        let slots = armed.len / std::mem::size_of::<u64>();
        let start = 1 + count * CMP_RECORD_WORDS;
        if start + CMP_RECORD_WORDS > slots {
            return;
        }

        for (i, word) in [kind, arg1, arg2, pc].into_iter().enumerate() {
            write_word(armed.area, EntryWidth::U64, start + i, word);
        }
        write_word(armed.area, EntryWidth::U64, 0, count as u64 + 1);
    }

    /// A native call with one traced basic block
    pub unsafe extern "C" fn traced_call(
        a: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize,
        _: isize, _: isize) -> isize {
        trace_pc(0xffff_0000_0000_1000 + a as u64);
        a
    }

    /// A native call that compares its first two arguments
    pub unsafe extern "C" fn comparing_call(
        a: isize, b: isize, _: isize, _: isize, _: isize, _: isize, _: isize,
        _: isize, _: isize) -> isize {
        // 8-byte, non-constant comparison
        trace_cmp(3 << 1, a as u64, b as u64, 0xffff_0000_0000_2000);
        (a == b) as isize
    }

    /// A native call with no instrumentation at all
    pub unsafe extern "C" fn silent_call(
        a: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize,
        _: isize, _: isize) -> isize {
        a
    }
}
