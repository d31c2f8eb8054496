/// This file contains all of the logic necessary to prepare the process-wide
/// resources an executor needs before any execution unit starts: the shared
/// input region at a fixed address, a descriptor limit high enough for the
/// control pipes and every coverage device, and the child exit notification
/// that wakes up a supervising wait loop.
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::dispatch::MAX_ARGS;
use crate::err::ExecErr;

// Size of one word sized argument in the input region
const ARG_SIZE: usize = std::mem::size_of::<isize>();

// Both ends of the child notification pipe, -1 until installed
static WAKE_READ: AtomicI32 = AtomicI32::new(-1);
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);

// Guards the one-time signal installation
static SIGCHLD_INIT: Once = Once::new();

/// Memory permission bits, same encoding as the `PROT_*` constants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Perms(i32);

impl Perms {
    pub const READ: Perms = Perms(libc::PROT_READ);
    pub const WRITE: Perms = Perms(libc::PROT_WRITE);
    pub const EXEC: Perms = Perms(libc::PROT_EXEC);
    pub const RWX: Perms = Perms(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC);

    pub fn contains(&self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn prot(&self) -> libc::c_int {
        self.0
    }
}

/// An address that carries its own bounds and permissions. Without hardware
/// capabilities this is just the requested address, the requested length and
/// whatever permissions we mapped it with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capability {
    base: usize,
    length: usize,
    perms: Perms,
}

impl Capability {
    pub fn new(base: usize, length: usize, perms: Perms) -> Self {
        Capability { base, length, perms }
    }

    pub fn address(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn perms(&self) -> Perms {
        self.perms
    }

    /// Does `[offset, offset + len)` fall inside the bounds
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.length,
            None => false,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }
}

// Location of errno for the calling thread, the handler has to preserve it
#[cfg(target_os = "linux")]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(target_os = "freebsd")]
unsafe fn errno_ptr() -> *mut libc::c_int {
    libc::__error()
}

// Runs in signal context, only async-signal-safe calls in here
extern "C" fn sigchld_handler(_sig: libc::c_int) {
    let fd = WAKE_WRITE.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    unsafe {
        let saved = *errno_ptr();
        let byte = 1u8;

        // Pipe full means a wakeup is already pending, nothing to do
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *errno_ptr() = saved;
    }
}

// Mark a descriptor non-blocking and close-on-exec
fn set_pipe_flags(fd: RawFd) -> Result<(), ExecErr> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1
        || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        return Err(ExecErr::from_os(&format!("fcntl O_NONBLOCK failed, fd={}", fd)));
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(ExecErr::from_os(&format!("fcntl FD_CLOEXEC failed, fd={}", fd)));
    }

    Ok(())
}

// Non-blocking close-on-exec pipe, nothing stays open on failure
fn wake_pipe() -> Result<[RawFd; 2], ExecErr> {
    let mut fds = [-1 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(ExecErr::from_os("pipe for child notification failed"));
    }

    if let Err(err) = set_pipe_flags(fds[0]).and_then(|_| set_pipe_flags(fds[1])) {
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(err);
    }

    Ok(fds)
}

// Create the wake pipe and install the SIGCHLD handler. No SA_RESTART, a
// blocking sleep in the supervisor has to come back with EINTR
fn install_sigchld() -> Result<(), ExecErr> {
    let fds = wake_pipe()?;

    WAKE_READ.store(fds[0], Ordering::SeqCst);
    WAKE_WRITE.store(fds[1], Ordering::SeqCst);

    let result = unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = sigchld_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        act.sa_flags = 0;
        libc::sigemptyset(&mut act.sa_mask);
        libc::sigaction(libc::SIGCHLD, &act, std::ptr::null_mut())
    };

    if result == -1 {
        return Err(ExecErr::from_os("sigaction for SIGCHLD failed"));
    }

    Ok(())
}

/// Wakes a waiting thread when any child of this process exits. Every clone
/// observes the same process-wide notification
#[derive(Clone, Copy, Debug)]
pub struct ChildNotifier {
    read_fd: RawFd,
}

impl ChildNotifier {
    /// Block until a child exits or `timeout` elapses, true means a child
    /// exited (possibly before we started waiting)
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.drain() {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            let mut pfd = libc::pollfd {
                fd: self.read_fd,
                events: libc::POLLIN,
                revents: 0,
            };

            // Round up so a sub-millisecond remainder still sleeps
            let millis = remaining.as_millis().max(1).min(libc::c_int::MAX as u128);
            let result = unsafe { libc::poll(&mut pfd, 1, millis as libc::c_int) };

            // EINTR and readiness both loop back around to the drain
            if result == 0 && Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Discard pending notifications, returns whether there were any
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut woke = false;

        loop {
            let result = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };

            if result <= 0 {
                return woke;
            }

            woke = true;
        }
    }
}

/// Process-scoped executor environment, holds what used to be global state.
/// The region is torn down when the environment is dropped
pub struct Environment {
    region: Option<Capability>,
    max_fd: u64,
    notifier: Option<ChildNotifier>,
}

impl Environment {
    pub fn new(config: &Config) -> Self {
        Environment {
            region: None,
            max_fd: config.max_fd,
            notifier: None,
        }
    }

    /// Map the shared input region at `addr` and set up the rest of the
    /// process state. Repeating the call with the same bounds is a no-op for
    /// the region, different bounds replace the mapping
    pub fn initialize(&mut self, addr: usize, size: usize) -> Result<(), ExecErr> {
        match self.region {
            Some(region) if region.address() == addr && region.len() == size => (),
            Some(region) => {
                // Stale mapping from a previous request, drop it first
                unmap_region(&region)?;
                self.region = None;
                self.region = Some(map_region(addr, size)?);
            }
            None => {
                self.region = Some(map_region(addr, size)?);
            }
        }

        raise_fd_limit(self.max_fd)?;

        // Signal disposition is per process, only ever do this once
        let mut install_result = Ok(());
        SIGCHLD_INIT.call_once(|| {
            install_result = install_sigchld();
        });
        install_result?;

        let read_fd = WAKE_READ.load(Ordering::SeqCst);
        if read_fd < 0 {
            return Err(ExecErr::from("child notification is not installed"));
        }
        self.notifier = Some(ChildNotifier { read_fd });

        Ok(())
    }

    pub fn region(&self) -> Option<&Capability> {
        self.region.as_ref()
    }

    pub fn notifier(&self) -> Option<ChildNotifier> {
        self.notifier
    }

    // Bounds-check an access against the current region
    fn checked_region(&self, offset: usize, len: usize) -> Result<&Capability, ExecErr> {
        let Some(region) = self.region.as_ref() else {
            return Err(ExecErr::from("Input region accessed before initialization"));
        };

        if !region.contains(offset, len) {
            return Err(ExecErr::from(&format!(
                "Input region access out of bounds, offset=0x{:X}, len=0x{:X}, size=0x{:X}",
                offset, len, region.len())));
        }

        Ok(region)
    }

    pub fn read_input(&self, offset: usize, len: usize) -> Result<&[u8], ExecErr> {
        let region = self.checked_region(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(region.as_ptr().add(offset), len) })
    }

    pub fn write_input(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ExecErr> {
        let region = self.checked_region(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(), region.as_ptr().add(offset), bytes.len());
        }

        Ok(())
    }

    /// Read a full argument vector the orchestrator placed at `offset`
    pub fn args_at(&self, offset: usize) -> Result<[isize; MAX_ARGS], ExecErr> {
        let bytes = self.read_input(offset, ARG_SIZE * MAX_ARGS)?;

        let mut args = [0isize; MAX_ARGS];
        for (arg, chunk) in args.iter_mut().zip(bytes.chunks_exact(ARG_SIZE)) {
            let mut word = [0u8; ARG_SIZE];
            word.copy_from_slice(chunk);
            *arg = isize::from_ne_bytes(word);
        }

        Ok(args)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            let _ = unmap_region(&region);
        }
    }
}

// Anonymous private RWX mapping at exactly `addr`
fn map_region(addr: usize, size: usize) -> Result<Capability, ExecErr> {
    let perms = Perms::RWX;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED;

    let result = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size as libc::size_t,
            perms.prot(),
            flags,
            -1,
            0
        )
    };

    if result == libc::MAP_FAILED {
        return Err(ExecErr::from_os(&format!(
            "mmap of input region failed, addr=0x{:X}, size=0x{:X}", addr, size)));
    }

    if result as usize != addr {
        unsafe { libc::munmap(result, size) };
        return Err(ExecErr::from(&format!(
            "mmap of input region landed at 0x{:X} instead of 0x{:X}", result as usize, addr)));
    }

    Ok(Capability::new(addr, size, perms))
}

fn unmap_region(region: &Capability) -> Result<(), ExecErr> {
    let result = unsafe {
        libc::munmap(region.as_ptr() as *mut libc::c_void, region.len())
    };

    if result == -1 {
        return Err(ExecErr::from_os(&format!(
            "munmap of input region failed, addr=0x{:X}, size=0x{:X}",
            region.address(), region.len())));
    }

    Ok(())
}

// Makes sure the descriptor limit covers the control pipes and every
// execution unit's coverage device
fn raise_fd_limit(max_fd: u64) -> Result<(), ExecErr> {
    let rlim = libc::rlimit {
        rlim_cur: max_fd as libc::rlim_t,
        rlim_max: max_fd as libc::rlim_t,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } == -1 {
        return Err(ExecErr::from_os(&format!("setrlimit(RLIMIT_NOFILE, {}) failed", max_fd)));
    }

    Ok(())
}
