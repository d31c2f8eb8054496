//! This file contains the logic for executing one decoded call on behalf of
//! the fuzzer. Every call goes through the same fixed-arity contract so the
//! description layer never has to care how many arguments a call really takes

/// Maximum number of word sized arguments any call receives
pub const MAX_ARGS: usize = 9;

/// A native entry point, always handed the full argument vector. Wrappers
/// for callees that take fewer arguments simply ignore the rest
pub type NativeCall = unsafe extern "C" fn(
    isize, isize, isize, isize, isize, isize, isize, isize, isize) -> isize;

// How a call is reached
#[derive(Clone, Copy)]
enum Target {
    Native(NativeCall),
    Raw(usize),
}

/// Read-only description of one call to execute
#[derive(Clone, Copy)]
pub struct CallDescriptor {
    name: &'static str,
    target: Target,
}

impl CallDescriptor {
    pub fn native(name: &'static str, call: NativeCall) -> Self {
        CallDescriptor { name, target: Target::Native(call) }
    }

    pub fn raw(name: &'static str, sys_nr: usize) -> Self {
        CallDescriptor { name, target: Target::Raw(sys_nr) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The raw call number, `None` for native entry points
    pub fn sys_nr(&self) -> Option<usize> {
        match self.target {
            Target::Raw(nr) => Some(nr),
            Target::Native(_) => None,
        }
    }
}

impl std::fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target {
            Target::Native(call) => write!(f, "{}@0x{:X}", self.name, call as usize),
            Target::Raw(nr) => write!(f, "{}#{}", self.name, nr),
        }
    }
}

/// Execute the call and hand back whatever it returned, no errno handling,
/// no retries
///
/// # Safety
///
/// The call is arbitrary fuzzer-chosen code, it can do anything to this
/// process that the arguments allow
pub unsafe fn execute_syscall(call: &CallDescriptor, a: &[isize; MAX_ARGS]) -> isize {
    match call.target {
        Target::Native(native) => native(a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8]),
        Target::Raw(nr) => libc::syscall(
            nr as _,
            a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8]) as isize,
    }
}
