//! Cross-thread register editing.
//!
//! A short-lived worker thread suspends the target, rewrites its debug
//! registers and resumes it, while the requesting thread blocks on a
//! completion signal. The target may be the requesting thread itself: it is
//! parked on the signal for the whole suspend window.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::arch::DebugRegisters;
use crate::breakpoint::hardware::Spec;
use crate::codec::Slot;
use crate::editor::{Editor, Tid};
use crate::error::Error;

/// The OS primitives the handshake needs.
///
/// Everything but `open` runs while the target is suspended and may be
/// holding the allocator's lock, so those errors carry only static text.
pub trait ThreadBackend: Send + Sync + 'static {
    /// Open handle to a thread; released on drop.
    type Handle: Send + 'static;

    fn open(&self, target: Tid) -> Result<Self::Handle, Error>;
    fn suspend(&self, handle: &Self::Handle) -> Result<(), Error>;
    fn resume(&self, handle: &Self::Handle) -> Result<(), Error>;
    fn read(&self, handle: &Self::Handle) -> Result<DebugRegisters, Error>;
    fn write(&self, handle: &Self::Handle, regs: &DebugRegisters) -> Result<(), Error>;
}

/// One-shot completion signal.
struct Completion<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn complete(&self, value: T) {
        *self.value.lock() = Some(value);
        self.ready.notify_one();
    }

    fn wait(&self) -> T {
        let mut value = self.value.lock();
        loop {
            if let Some(value) = value.take() {
                return value;
            }
            self.ready.wait(&mut value);
        }
    }
}

pub struct HandshakeEditor<B> {
    backend: Arc<B>,
}

impl<B: ThreadBackend> HandshakeEditor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn apply<T, F>(&self, target: Tid, edit: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut DebugRegisters) -> Result<T, Error> + Send + 'static,
    {
        let handle = self.backend.open(target)?;
        let completion = Completion::new();

        let backend = self.backend.clone();
        let signal = completion.clone();

        thread::Builder::new()
            .name("fugue-watch-editor".into())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    while_suspended(&*backend, &handle, edit)
                }))
                .unwrap_or_else(|_| Err(Error::Worker("editor thread panicked".into())));

                drop(handle);
                signal.complete(result);
            })?;

        completion.wait()
    }
}

/// The target is stalled for the whole of this function. No logging in here:
/// the target may hold the subscriber's lock.
fn while_suspended<B, T, F>(backend: &B, handle: &B::Handle, edit: F) -> Result<T, Error>
where
    B: ThreadBackend,
    F: FnOnce(&mut DebugRegisters) -> Result<T, Error>,
{
    backend.suspend(handle)?;

    let result = backend.read(handle).and_then(|mut regs| {
        let value = edit(&mut regs)?;
        backend.write(handle, &regs)?;
        Ok(value)
    });

    let resumed = backend.resume(handle);
    let value = result?;
    resumed?;

    Ok(value)
}

impl<B: ThreadBackend> Editor for HandshakeEditor<B> {
    fn attach(&self, target: Tid, spec: &Spec) -> Result<Slot, Error> {
        let spec = *spec;

        debug!(thread = %target, "arming {} breakpoint at {:#x}/{}", spec.kind(), spec.address(), spec.size());

        let slot = self.apply(target, move |regs| {
            regs.arm(&spec)
                .ok_or_else(|| Error::ResourceExhausted(spec.address()))
        })?;

        debug!(thread = %target, %slot, "armed");
        Ok(slot)
    }

    fn detach(&self, target: Tid, spec: &Spec, slot: Slot) -> Result<(), Error> {
        debug!(thread = %target, %slot, "disarming breakpoint at {:#x}", spec.address());

        self.apply(target, move |regs| {
            regs.disarm(slot);
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::Word;
    use crate::breakpoint::hardware::{Kind, Size};
    use crate::codec;
    use fnv::FnvHashMap as HashMap;
    use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

    /// Register files for a handful of make-believe threads.
    #[derive(Default)]
    pub(crate) struct FakeThreads {
        pub regs: Mutex<HashMap<Tid, DebugRegisters>>,
        pub suspended: AtomicIsize,
        pub suspends: AtomicUsize,
        pub writes: AtomicUsize,
        pub deny_open: AtomicBool,
        pub fail_read: AtomicBool,
    }

    impl FakeThreads {
        pub fn registers(&self, target: Tid) -> DebugRegisters {
            self.regs.lock().get(&target).copied().unwrap_or_default()
        }

        /// Registers as the CPU would leave them after a read (or, with
        /// `write`, a write) of `address`.
        pub fn trap(&self, target: Tid, address: Word, write: bool) -> DebugRegisters {
            let mut regs = self.registers(target);
            regs.status = 0;
            for slot in codec::armed_slots(regs.control) {
                let hit = regs.address[slot.index()] == address
                    && match codec::slot_kind(regs.control, slot) {
                        Some(Kind::Write) => write,
                        Some(Kind::Access) => true,
                        _ => false,
                    };
                if hit {
                    regs.status |= 1 << slot.index();
                }
            }
            regs
        }
    }

    impl ThreadBackend for FakeThreads {
        type Handle = Tid;

        fn open(&self, target: Tid) -> Result<Tid, Error> {
            if self.deny_open.load(Ordering::SeqCst) {
                return Err(Error::Privilege(target, "access denied".into()));
            }
            Ok(target)
        }

        fn suspend(&self, _handle: &Tid) -> Result<(), Error> {
            self.suspended.fetch_add(1, Ordering::SeqCst);
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&self, _handle: &Tid) -> Result<(), Error> {
            self.suspended.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&self, handle: &Tid) -> Result<DebugRegisters, Error> {
            if self.fail_read.load(Ordering::SeqCst) {
                return Err(Error::Context(*handle, "read failed"));
            }
            Ok(self.registers(*handle))
        }

        fn write(&self, handle: &Tid, regs: &DebugRegisters) -> Result<(), Error> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.regs.lock().insert(*handle, *regs);
            Ok(())
        }
    }

    pub(crate) fn editor() -> Arc<HandshakeEditor<FakeThreads>> {
        Arc::new(HandshakeEditor::new(FakeThreads::default()))
    }

    fn spec(address: Word) -> Spec {
        Spec::new(Kind::Write, address, Size::Four).unwrap()
    }

    #[test]
    fn attach_programs_first_free_slot() {
        let editor = editor();
        let target = Tid::from_raw(7);

        let slot = editor.attach(target, &spec(0x1000)).unwrap();
        assert_eq!(slot.index(), 0);

        let regs = editor.backend().registers(target);
        assert_eq!(regs.address[0], 0x1000);
        assert_eq!(regs.control, 0x000d_0001);
        assert_eq!(editor.backend().suspended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fifth_attach_is_exhausted() {
        let editor = editor();
        let target = Tid::from_raw(7);

        for i in 0..4 {
            let slot = editor.attach(target, &spec(0x1000 + 4 * i)).unwrap();
            assert_eq!(slot.index(), i as usize);
        }

        let before = editor.backend().registers(target);
        let writes = editor.backend().writes.load(Ordering::SeqCst);

        assert!(matches!(
            editor.attach(target, &spec(0x2000)),
            Err(Error::ResourceExhausted(0x2000))
        ));
        assert_eq!(editor.backend().registers(target), before);
        assert_eq!(editor.backend().writes.load(Ordering::SeqCst), writes);
        assert_eq!(editor.backend().suspended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn threads_have_separate_slots() {
        let editor = editor();

        for _ in 0..4 {
            editor.attach(Tid::from_raw(1), &spec(0x1000)).unwrap();
        }
        assert_eq!(editor.attach(Tid::from_raw(2), &spec(0x1000)).unwrap().index(), 0);
    }

    #[test]
    fn detach_restores_enable_bit_only() {
        let editor = editor();
        let target = Tid::from_raw(3);

        editor.attach(target, &spec(0x1000)).unwrap();
        let before = editor.backend().registers(target).control;

        let slot = editor.attach(target, &spec(0x2000)).unwrap();
        editor.detach(target, &spec(0x2000), slot).unwrap();

        let after = editor.backend().registers(target).control;
        assert_eq!(after & 0xff, before & 0xff);
        assert!(codec::slot_enabled(after, Slot::new(0).unwrap()));
        assert_eq!(after & 0xf_0000, before & 0xf_0000);
    }

    #[test]
    fn open_failure_never_suspends() {
        let editor = editor();
        editor.backend().deny_open.store(true, Ordering::SeqCst);

        assert!(matches!(
            editor.attach(Tid::from_raw(1), &spec(0x1000)),
            Err(Error::Privilege(..))
        ));
        assert_eq!(editor.backend().suspends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn read_failure_still_resumes() {
        let editor = editor();
        editor.backend().fail_read.store(true, Ordering::SeqCst);

        assert!(matches!(
            editor.attach(Tid::from_raw(1), &spec(0x1000)),
            Err(Error::Context(tid, "read failed")) if tid == Tid::from_raw(1)
        ));
        assert_eq!(editor.backend().suspends.load(Ordering::SeqCst), 1);
        assert_eq!(editor.backend().suspended.load(Ordering::SeqCst), 0);
        assert_eq!(editor.backend().writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_hands_value_across_threads() {
        let completion = Completion::new();
        let signal = completion.clone();

        let worker = thread::spawn(move || signal.complete(42));
        assert_eq!(completion.wait(), 42);
        worker.join().unwrap();
    }
}
