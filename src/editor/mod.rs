//! Editors mutate a live thread's debug registers.
//!
//! A thread cannot safely rewrite its own debug registers while running, so
//! every editor performs the read-modify-write from somewhere else: a helper
//! thread that suspends the target ([`handshake`]), or a disposable tracer
//! process ([`tracer`]).

pub mod handshake;
pub mod tracer;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;

use parking_lot::{const_mutex, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

use crate::breakpoint::hardware::Spec;
use crate::codec::Slot;
use crate::error::Error;

/// OS identifier of a thread (a Linux tid, a Win32 thread id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u64);

impl Tid {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    #[cfg(target_os = "linux")]
    pub fn current() -> Self {
        Self(nix::unistd::gettid().as_raw() as u64)
    }

    #[cfg(windows)]
    pub fn current() -> Self {
        Self(unsafe { ::windows::Win32::System::Threading::GetCurrentThreadId() } as u64)
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    pub fn current() -> Self {
        Self(0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait Editor {
    /// Claims a free slot on `target` and programs it for `spec`.
    fn attach(&self, target: Tid, spec: &Spec) -> Result<Slot, Error>;

    /// Disables `slot` on `target`.
    fn detach(&self, target: Tid, spec: &Spec, slot: Slot) -> Result<(), Error>;
}

pub type DynEditor = Box<dyn Editor + Send + Sync>;

impl<E: Editor + ?Sized> Editor for Box<E> {
    fn attach(&self, target: Tid, spec: &Spec) -> Result<Slot, Error> {
        (**self).attach(target, spec)
    }

    fn detach(&self, target: Tid, spec: &Spec, slot: Slot) -> Result<(), Error> {
        (**self).detach(target, spec, slot)
    }
}

impl<E: Editor + ?Sized> Editor for Arc<E> {
    fn attach(&self, target: Tid, spec: &Spec) -> Result<Slot, Error> {
        (**self).attach(target, spec)
    }

    fn detach(&self, target: Tid, spec: &Spec, slot: Slot) -> Result<(), Error> {
        (**self).detach(target, spec, slot)
    }
}

impl<'a, E: Editor + ?Sized> Editor for &'a E {
    fn attach(&self, target: Tid, spec: &Spec) -> Result<Slot, Error> {
        (**self).attach(target, spec)
    }

    fn detach(&self, target: Tid, spec: &Spec, slot: Slot) -> Result<(), Error> {
        (**self).detach(target, spec, slot)
    }
}

/// Stand-in for platforms without a register editor; every request fails
/// with [`Error::PlatformUnsupported`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl Editor for Unsupported {
    fn attach(&self, _target: Tid, _spec: &Spec) -> Result<Slot, Error> {
        Err(Error::PlatformUnsupported)
    }

    fn detach(&self, _target: Tid, _spec: &Spec, _slot: Slot) -> Result<(), Error> {
        Err(Error::PlatformUnsupported)
    }
}

static EDIT_LOCK: Mutex<()> = const_mutex(());

/// Serialises every attach and detach in the process.
///
/// Two edits racing on one thread would both read the same control word and
/// hand out the same slot; the tracer editor additionally relies on the
/// process-wide ptracer grant staying put while its child attaches.
pub fn exclusive() -> MutexGuard<'static, ()> {
    EDIT_LOCK.lock()
}

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub fn native() -> DynEditor {
    Box::new(tracer::TracerEditor::default())
}

#[cfg(all(windows, target_arch = "x86_64"))]
pub fn native() -> DynEditor {
    Box::new(handshake::HandshakeEditor::new(self::windows::WindowsThreads))
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")),
    all(windows, target_arch = "x86_64")
)))]
pub fn native() -> DynEditor {
    Box::new(Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::hardware::{Kind, Size};

    #[test]
    fn unsupported_reports_failure() {
        let spec = Spec::new(Kind::Write, 0x1000, Size::Four).unwrap();
        let slot = Slot::new(0).unwrap();

        assert!(matches!(
            Unsupported.attach(Tid::current(), &spec),
            Err(Error::PlatformUnsupported)
        ));
        assert!(matches!(
            Unsupported.detach(Tid::current(), &spec, slot),
            Err(Error::PlatformUnsupported)
        ));
    }
}
