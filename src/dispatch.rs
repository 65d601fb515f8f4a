//! Trap dispatch and the process-wide handler registry.
//!
//! A single handler receives the watched address of every breakpoint that
//! fires. The platform interceptor (a `SIGTRAP` action on Linux, a vectored
//! exception handler on Windows) is installed with the first handler and
//! removed again when the handler is cleared.

use parking_lot::{const_mutex, Mutex};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::arch::{DebugRegisters, Word};
use crate::codec::Slot;
use crate::error::Error;

/// Called with the watched address, in trap context.
pub type Handler = fn(Word);

static HANDLER: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: Mutex<bool> = const_mutex(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled { slot: Slot, address: Word },
    Unclaimed,
}

impl Disposition {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled { .. })
    }
}

fn encode(handler: Option<Handler>) -> usize {
    handler.map_or(0, |handler| handler as *const () as usize)
}

fn current() -> Option<Handler> {
    match HANDLER.load(Ordering::SeqCst) {
        0 => None,
        raw => Some(unsafe { mem::transmute::<usize, Handler>(raw) }),
    }
}

/// Replaces the registered handler.
///
/// The interceptor is installed along with the first handler and removed
/// when `None` is registered. If installation fails the previous handler is
/// put back.
pub fn set_handler(handler: Option<Handler>) -> Result<(), Error> {
    let mut installed = INSTALLED.lock();
    let previous = HANDLER.swap(encode(handler), Ordering::SeqCst);

    match (handler.is_some(), *installed) {
        (true, false) => {
            if let Err(e) = interceptor::install() {
                HANDLER.store(previous, Ordering::SeqCst);
                return Err(e);
            }
            *installed = true;
            debug!("trap interceptor installed");
        }
        (false, true) => {
            interceptor::uninstall()?;
            *installed = false;
            debug!("trap interceptor removed");
        }
        _ => (),
    }

    Ok(())
}

/// Routes a trap to the handler if one of our slots fired.
pub fn dispatch(regs: &DebugRegisters) -> Disposition {
    let (slot, address) = match regs.triggered() {
        Some(hit) => hit,
        None => return Disposition::Unclaimed,
    };

    if let Some(handler) = current() {
        handler(address);
    }

    Disposition::Handled { slot, address }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
mod interceptor {
    use nix::libc::{self, c_int, c_void, siginfo_t};
    use std::cell::UnsafeCell;
    use std::{io, mem, ptr};

    use super::{dispatch, Disposition};
    use crate::editor::{tracer, Tid};
    use crate::error::Error;

    const TRAP_HWBKPT: c_int = 4;

    struct PreviousAction(UnsafeCell<Option<libc::sigaction>>);

    // written only under the registry lock while our action is not installed
    unsafe impl Sync for PreviousAction {}

    static PREVIOUS: PreviousAction = PreviousAction(UnsafeCell::new(None));

    pub(super) fn install() -> Result<(), Error> {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_trap as *const () as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);

            let mut previous: libc::sigaction = mem::zeroed();
            *PREVIOUS.0.get() = None;

            if libc::sigaction(libc::SIGTRAP, &action, &mut previous) != 0 {
                return Err(Error::Interceptor(io::Error::last_os_error().to_string()));
            }

            *PREVIOUS.0.get() = Some(previous);
        }

        Ok(())
    }

    pub(super) fn uninstall() -> Result<(), Error> {
        unsafe {
            let previous = match *PREVIOUS.0.get() {
                Some(previous) => previous,
                None => return Ok(()),
            };

            if libc::sigaction(libc::SIGTRAP, &previous, ptr::null_mut()) != 0 {
                return Err(Error::Interceptor(io::Error::last_os_error().to_string()));
            }

            *PREVIOUS.0.get() = None;
        }

        Ok(())
    }

    #[cfg(test)]
    pub(super) fn is_installed() -> bool {
        unsafe {
            let mut current: libc::sigaction = mem::zeroed();
            libc::sigaction(libc::SIGTRAP, ptr::null(), &mut current) == 0
                && current.sa_sigaction == on_trap as *const () as usize
        }
    }

    extern "C" fn on_trap(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let hardware = !info.is_null() && unsafe { (*info).si_code } == TRAP_HWBKPT;

        if hardware {
            if let Some(regs) = tracer::inspect_in_trap(Tid::current()) {
                if let Disposition::Handled { .. } = dispatch(&regs) {
                    return;
                }
            }
        }

        unsafe { chain(signal, info, context) }
    }

    /// Hands the signal to whatever was installed before us.
    unsafe fn chain(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let previous = match *PREVIOUS.0.get() {
            Some(previous) => previous,
            None => {
                let mut default: libc::sigaction = mem::zeroed();
                default.sa_sigaction = libc::SIG_DFL;
                default
            }
        };

        match previous.sa_sigaction {
            libc::SIG_IGN => (),
            libc::SIG_DFL => {
                let mut default: libc::sigaction = mem::zeroed();
                default.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(signal, &default, ptr::null_mut());
                libc::raise(signal);
            }
            handler if previous.sa_flags & libc::SA_SIGINFO != 0 => {
                let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                    mem::transmute(handler);
                handler(signal, info, context)
            }
            handler => {
                let handler: extern "C" fn(c_int) = mem::transmute(handler);
                handler(signal)
            }
        }
    }
}

#[cfg(all(windows, target_arch = "x86_64"))]
mod interceptor {
    use std::ffi::c_void;
    use std::ptr;
    use std::sync::atomic::{AtomicPtr, Ordering};

    use windows::Win32::System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_POINTERS,
    };

    use super::{dispatch, Disposition};
    use crate::arch::DebugRegisters;
    use crate::breakpoint::hardware::Kind;
    use crate::codec;
    use crate::error::Error;

    const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;

    const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    /// Resume flag; suppresses the instruction breakpoint for one instruction.
    const EFLAGS_RF: u32 = 0x1_0000;

    static HANDLE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

    pub(super) fn install() -> Result<(), Error> {
        let handle = unsafe { AddVectoredExceptionHandler(1, Some(on_exception)) };
        if handle.is_null() {
            return Err(Error::Interceptor(
                "AddVectoredExceptionHandler failed".into(),
            ));
        }

        HANDLE.store(handle, Ordering::SeqCst);
        Ok(())
    }

    pub(super) fn uninstall() -> Result<(), Error> {
        let handle = HANDLE.swap(ptr::null_mut(), Ordering::SeqCst);
        if !handle.is_null() && unsafe { RemoveVectoredExceptionHandler(handle) } == 0 {
            HANDLE.store(handle, Ordering::SeqCst);
            return Err(Error::Interceptor(
                "RemoveVectoredExceptionHandler failed".into(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn is_installed() -> bool {
        !HANDLE.load(Ordering::SeqCst).is_null()
    }

    unsafe extern "system" fn on_exception(info: *mut EXCEPTION_POINTERS) -> i32 {
        if info.is_null() {
            return EXCEPTION_CONTINUE_SEARCH;
        }

        let record = (*info).ExceptionRecord;
        let context = (*info).ContextRecord;

        if record.is_null() || context.is_null() {
            return EXCEPTION_CONTINUE_SEARCH;
        }

        if (*record).ExceptionCode.0 as u32 != EXCEPTION_SINGLE_STEP {
            return EXCEPTION_CONTINUE_SEARCH;
        }

        let regs = DebugRegisters {
            address: [(*context).Dr0, (*context).Dr1, (*context).Dr2, (*context).Dr3],
            status: (*context).Dr6,
            control: (*context).Dr7,
        };

        match dispatch(&regs) {
            Disposition::Handled { slot, .. } => {
                (*context).Dr6 = 0;
                if codec::slot_kind(regs.control, slot) == Some(Kind::Execute) {
                    (*context).EFlags |= EFLAGS_RF;
                }
                EXCEPTION_CONTINUE_EXECUTION
            }
            Disposition::Unclaimed => EXCEPTION_CONTINUE_SEARCH,
        }
    }
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")),
    all(windows, target_arch = "x86_64")
)))]
mod interceptor {
    use crate::error::Error;

    pub(super) fn install() -> Result<(), Error> {
        Err(Error::PlatformUnsupported)
    }

    pub(super) fn uninstall() -> Result<(), Error> {
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn is_installed() -> bool {
        false
    }
}
