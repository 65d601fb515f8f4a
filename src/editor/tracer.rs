//! Register editing through a disposable tracer process.
//!
//! Where a thread's register context cannot be edited in-process, a forked
//! child attaches to the target thread with `ptrace`, rewrites the debug
//! registers in its user area, detaches and exits. The exit status is the
//! only completion signal: it carries either the outcome (the slot that was
//! claimed) or the step that failed.
//!
//! The child runs in a copy of a possibly multi-threaded process, so it is
//! restricted to async-signal-safe calls: no allocation, no locks, no logging.

use std::mem::size_of;

use crate::arch::{DebugRegisters, Word, DEBUG_CONTROL_REG, DEBUG_STATUS_REG, SNAPSHOT_REGISTERS};
use crate::breakpoint::hardware::Spec;
use crate::codec::Slot;

pub const EXIT_OK: i32 = 0;
pub const EXIT_EXHAUSTED: i32 = 32;

/// Where a tracer gave up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Step {
    Gate = 16,
    Attach,
    Interrupt,
    PeekRegisters,
    PokeAddress,
    PokeStatus,
    PokeControl,
    Report,
    Detach,
}

impl Step {
    const ALL: [Step; 9] = [
        Step::Gate,
        Step::Attach,
        Step::Interrupt,
        Step::PeekRegisters,
        Step::PokeAddress,
        Step::PokeStatus,
        Step::PokeControl,
        Step::Report,
        Step::Detach,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.code() == code)
    }

    /// Steps that fail when the OS refuses to let us trace the target.
    pub fn is_privilege(self) -> bool {
        matches!(self, Step::Gate | Step::Attach | Step::Interrupt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Arm(Spec),
    Disarm(Slot),
    /// Report the registers and clear the status register.
    Inspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;

/// Peek/poke access to a stopped thread's debug registers.
pub trait UserArea {
    fn peek(&mut self, register: usize) -> Result<Word, Fault>;
    fn poke(&mut self, register: usize, value: Word) -> Result<(), Fault>;
}

/// Runs `program` against `area` and returns the tracer's exit code.
///
/// Only registers that changed are written back: address registers first,
/// the control register last, so a slot is never enabled before its address
/// is in place.
pub fn run<U, R>(program: &Program, area: &mut U, mut report: R) -> Result<i32, Step>
where
    U: UserArea,
    R: FnMut(&DebugRegisters) -> bool,
{
    let mut regs = DebugRegisters::default();
    for id in SNAPSHOT_REGISTERS.iter().copied() {
        let value = area.peek(id).map_err(|_| Step::PeekRegisters)?;
        if let Some(reg) = regs.register_mut(id) {
            *reg = value;
        }
    }

    let orig = regs;

    let code = match program {
        Program::Arm(spec) => match regs.arm(spec) {
            Some(slot) => slot.index() as i32,
            None => return Ok(EXIT_EXHAUSTED),
        },
        Program::Disarm(slot) => {
            regs.disarm(*slot);
            EXIT_OK
        }
        Program::Inspect => {
            if !report(&regs) {
                return Err(Step::Report);
            }
            regs.status = 0;
            EXIT_OK
        }
    };

    write_modified(area, &orig, &regs)?;

    Ok(code)
}

fn write_modified<U: UserArea>(
    area: &mut U,
    orig: &DebugRegisters,
    regs: &DebugRegisters,
) -> Result<(), Step> {
    for (i, (old, new)) in orig.address.iter().zip(regs.address.iter()).enumerate() {
        if old != new {
            area.poke(i, *new).map_err(|_| Step::PokeAddress)?;
        }
    }

    if orig.status != regs.status {
        area.poke(DEBUG_STATUS_REG, regs.status)
            .map_err(|_| Step::PokeStatus)?;
    }

    if orig.control != regs.control {
        area.poke(DEBUG_CONTROL_REG, regs.control)
            .map_err(|_| Step::PokeControl)?;
    }

    Ok(())
}

pub const REPORT_LEN: usize = SNAPSHOT_REGISTERS.len() * size_of::<Word>();

pub fn encode_report(regs: &DebugRegisters) -> [u8; REPORT_LEN] {
    let mut bytes = [0u8; REPORT_LEN];
    for (chunk, word) in bytes
        .chunks_exact_mut(size_of::<Word>())
        .zip(regs.to_words().iter())
    {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    bytes
}

pub fn decode_report(bytes: &[u8; REPORT_LEN]) -> DebugRegisters {
    let mut words = [0 as Word; 6];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(size_of::<Word>())) {
        let mut data = [0u8; size_of::<Word>()];
        data.copy_from_slice(chunk);
        *word = Word::from_ne_bytes(data);
    }
    DebugRegisters::from_words(&words)
}

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub use self::linux::{inspect_in_trap, TracerEditor};

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
mod linux {
    use nix::fcntl::OFlag;
    use nix::libc;
    use nix::sys::ptrace::Request;
    use nix::sys::wait::{WaitPidFlag, WaitStatus};
    use nix::unistd::{self, fork, ForkResult, Pid};
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tracing::debug;

    use super::*;
    use crate::arch::debug_offset;
    use crate::editor::{Editor, Tid};
    use crate::error::Error;
    use crate::util::{ptrace, waitpid, AsPid};

    const PR_SET_PTRACER: libc::c_int = 0x5961_6d61;

    /// Grant setting of the most recently built editor, for the trap path.
    static TRAP_GRANT: AtomicBool = AtomicBool::new(true);

    fn trap_grants_ptracer() -> bool {
        TRAP_GRANT.load(Ordering::SeqCst)
    }

    struct Tracee(Pid);

    impl UserArea for Tracee {
        fn peek(&mut self, register: usize) -> Result<Word, Fault> {
            ptrace(Request::PTRACE_PEEKUSER, self.0, debug_offset(register), 0)
                .map(|v| v as Word)
                .map_err(|_| Fault)
        }

        fn poke(&mut self, register: usize, value: Word) -> Result<(), Fault> {
            ptrace(Request::PTRACE_POKEUSER, self.0, debug_offset(register), value)
                .map(|_| ())
                .map_err(|_| Fault)
        }
    }

    /// Closes on drop.
    struct Fd(RawFd);

    impl Drop for Fd {
        fn drop(&mut self) {
            unistd::close(self.0).ok();
        }
    }

    struct Outcome {
        status: WaitStatus,
        report: Option<DebugRegisters>,
    }

    /// Drops the child's copy of the gate's write end, then waits for the
    /// parent's byte. EOF means the parent gave up.
    fn await_gate(gate: RawFd, gate_tx: RawFd) -> bool {
        unistd::close(gate_tx).ok();

        let mut byte = [0u8; 1];
        matches!(unistd::read(gate, &mut byte), Ok(1))
    }

    /// Body of the forked tracer; the return value is its exit code.
    fn tracer_main(target: Pid, program: &Program, report: RawFd) -> i32 {
        if ptrace(Request::PTRACE_SEIZE, target, 0, 0).is_err() {
            return Step::Attach.code();
        }

        if ptrace(Request::PTRACE_INTERRUPT, target, 0, 0).is_err()
            || waitpid(target, Some(WaitPidFlag::__WALL)).is_err()
        {
            // exiting drops the attachment
            return Step::Interrupt.code();
        }

        let code = run(program, &mut Tracee(target), |regs| {
            let bytes = encode_report(regs);
            matches!(unistd::write(report, &bytes), Ok(n) if n == bytes.len())
        })
        .unwrap_or_else(Step::code);

        if ptrace(Request::PTRACE_DETACH, target, 0, 0).is_err() {
            return Step::Detach.code();
        }

        code
    }

    /// Forks a tracer for `program` against `target` and waits for it.
    ///
    /// Async-signal-safe: the trap interceptor calls this from a signal
    /// handler.
    fn spawn(target: Tid, program: &Program, grant_ptracer: bool) -> nix::Result<Outcome> {
        let (gate_rx, gate_tx) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        let (gate_rx, gate_tx) = (Fd(gate_rx), Fd(gate_tx));

        let (report_rx, report_tx) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        let (report_rx, report_tx) = (Fd(report_rx), Fd(report_tx));

        match unsafe { fork() }? {
            ForkResult::Child => {
                unistd::close(report_rx.0).ok();

                let code = if await_gate(gate_rx.0, gate_tx.0) {
                    tracer_main(target.as_pid(), program, report_tx.0)
                } else {
                    Step::Gate.code()
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(gate_rx);
                drop(report_tx);

                // Yama only lets descendants trace us unless told otherwise
                if grant_ptracer {
                    unsafe {
                        libc::prctl(PR_SET_PTRACER, child.as_raw() as libc::c_ulong, 0, 0, 0);
                    }
                }

                // on failure the child reads EOF at the gate and exits
                let opened = unistd::write(gate_tx.0, &[1]);
                drop(gate_tx);

                let waited = waitpid(child, None);

                if grant_ptracer {
                    unsafe {
                        libc::prctl(PR_SET_PTRACER, 0 as libc::c_ulong, 0, 0, 0);
                    }
                }

                opened?;
                let (status, _) = waited?;

                let mut bytes = [0u8; REPORT_LEN];
                let report = match unistd::read(report_rx.0, &mut bytes) {
                    Ok(n) if n == REPORT_LEN => Some(decode_report(&bytes)),
                    _ => None,
                };

                Ok(Outcome { status, report })
            }
        }
    }

    /// Reads the calling thread's registers from inside a trap handler.
    pub fn inspect_in_trap(target: Tid) -> Option<DebugRegisters> {
        match spawn(target, &Program::Inspect, trap_grants_ptracer()) {
            Ok(Outcome {
                status: WaitStatus::Exited(_, EXIT_OK),
                report,
            }) => report,
            _ => None,
        }
    }

    /// Editor that forks a short-lived tracer for every edit.
    ///
    /// With `grant_ptracer` set, each tracer is named as our ptracer for the
    /// length of its run and the grant is reset to none afterwards. A grant
    /// the host program made itself does not survive an edit.
    ///
    /// The trap interceptor inspects registers with the setting of the most
    /// recently built editor.
    #[derive(Debug, Clone)]
    pub struct TracerEditor {
        grant_ptracer: bool,
    }

    impl Default for TracerEditor {
        fn default() -> Self {
            Self::new(true)
        }
    }

    impl TracerEditor {
        pub fn new(grant_ptracer: bool) -> Self {
            TRAP_GRANT.store(grant_ptracer, Ordering::SeqCst);
            Self { grant_ptracer }
        }

        fn execute(&self, target: Tid, program: &Program) -> Result<(i32, Option<DebugRegisters>), Error> {
            let outcome = spawn(target, program, self.grant_ptracer)?;
            match outcome.status {
                WaitStatus::Exited(_, code) => Ok((code, outcome.report)),
                status => Err(Error::TracerTerminated(format!("{:?}", status))),
            }
        }

        /// Current debug registers of `target`; clears its status register.
        pub fn inspect(&self, target: Tid) -> Result<DebugRegisters, Error> {
            match self.execute(target, &Program::Inspect)? {
                (EXIT_OK, Some(regs)) => Ok(regs),
                (EXIT_OK, None) => Err(Error::Tracer(Step::Report)),
                (code, _) => Err(failure(target, code)),
            }
        }
    }

    fn failure(target: Tid, code: i32) -> Error {
        match Step::from_code(code) {
            Some(step) if step.is_privilege() => {
                Error::Privilege(target, format!("tracer could not attach ({:?})", step))
            }
            Some(step) => Error::Tracer(step),
            None => Error::TracerTerminated(format!("exit code {}", code)),
        }
    }

    impl Editor for TracerEditor {
        fn attach(&self, target: Tid, spec: &Spec) -> Result<Slot, Error> {
            debug!(thread = %target, "arming {} breakpoint at {:#x}/{} via tracer", spec.kind(), spec.address(), spec.size());

            let (code, _) = self.execute(target, &Program::Arm(*spec))?;
            if code == EXIT_EXHAUSTED {
                return Err(Error::ResourceExhausted(spec.address()));
            }

            let slot = Slot::new(code as usize).ok_or_else(|| failure(target, code))?;

            debug!(thread = %target, %slot, "armed");
            Ok(slot)
        }

        fn detach(&self, target: Tid, spec: &Spec, slot: Slot) -> Result<(), Error> {
            debug!(thread = %target, %slot, "disarming breakpoint at {:#x} via tracer", spec.address());

            match self.execute(target, &Program::Disarm(slot))? {
                (EXIT_OK, _) => Ok(()),
                (code, _) => Err(failure(target, code)),
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::hardware::{Kind, Size};

    #[derive(Default)]
    struct FakeArea {
        regs: DebugRegisters,
        pokes: Vec<usize>,
        fail_peek: bool,
        fail_poke: Option<usize>,
    }

    impl UserArea for FakeArea {
        fn peek(&mut self, register: usize) -> Result<Word, Fault> {
            if self.fail_peek {
                return Err(Fault);
            }
            self.regs.register(register).ok_or(Fault)
        }

        fn poke(&mut self, register: usize, value: Word) -> Result<(), Fault> {
            if self.fail_poke == Some(register) {
                return Err(Fault);
            }
            self.pokes.push(register);
            *self.regs.register_mut(register).ok_or(Fault)? = value;
            Ok(())
        }
    }

    fn arm(address: Word) -> Program {
        Program::Arm(Spec::new(Kind::Access, address, Size::Four).unwrap())
    }

    #[test]
    fn arm_exits_with_slot() {
        let mut area = FakeArea::default();
        area.regs.control = 0b0001;

        assert_eq!(run(&arm(0x7000), &mut area, |_| true), Ok(1));
        assert_eq!(area.regs.address[1], 0x7000);
        assert_eq!(area.regs.control, 0b0101 | 0b1111 << 20);
        assert_eq!(area.pokes, vec![1, DEBUG_CONTROL_REG]);
    }

    #[test]
    fn arm_exhausted_writes_nothing() {
        let mut area = FakeArea::default();
        area.regs.control = 0b0101_0101;

        assert_eq!(run(&arm(0x7000), &mut area, |_| true), Ok(EXIT_EXHAUSTED));
        assert!(area.pokes.is_empty());
    }

    #[test]
    fn disarm_pokes_control_only() {
        let mut area = FakeArea::default();
        run(&arm(0x7000), &mut area, |_| true).unwrap();
        area.pokes.clear();

        let program = Program::Disarm(Slot::new(0).unwrap());
        assert_eq!(run(&program, &mut area, |_| true), Ok(EXIT_OK));
        assert_eq!(area.pokes, vec![DEBUG_CONTROL_REG]);
        assert_eq!(area.regs.control & 0xff, 0);
        assert_eq!(area.regs.address[0], 0x7000);
    }

    #[test]
    fn inspect_reports_then_clears_status() {
        let mut area = FakeArea::default();
        area.regs.address[2] = 0x9000;
        area.regs.status = 0b0100;

        let mut seen = None;
        assert_eq!(
            run(&Program::Inspect, &mut area, |regs| {
                seen = Some(*regs);
                true
            }),
            Ok(EXIT_OK)
        );
        assert_eq!(seen.and_then(|regs| regs.triggered()).map(|(s, a)| (s.index(), a)), Some((2, 0x9000)));
        assert_eq!(area.regs.status, 0);
        assert_eq!(area.pokes, vec![DEBUG_STATUS_REG]);
    }

    #[test]
    fn failures_name_their_step() {
        let mut area = FakeArea {
            fail_peek: true,
            ..Default::default()
        };
        assert_eq!(run(&arm(0x7000), &mut area, |_| true), Err(Step::PeekRegisters));

        let mut area = FakeArea {
            fail_poke: Some(0),
            ..Default::default()
        };
        assert_eq!(run(&arm(0x7000), &mut area, |_| true), Err(Step::PokeAddress));

        let mut area = FakeArea {
            fail_poke: Some(DEBUG_CONTROL_REG),
            ..Default::default()
        };
        assert_eq!(run(&arm(0x7000), &mut area, |_| true), Err(Step::PokeControl));

        let mut area = FakeArea::default();
        assert_eq!(run(&Program::Inspect, &mut area, |_| false), Err(Step::Report));
    }

    #[test]
    fn exit_codes_do_not_collide() {
        for step in Step::ALL.iter() {
            assert!(step.code() > 3 && step.code() != EXIT_EXHAUSTED);
            assert_eq!(Step::from_code(step.code()), Some(*step));
        }
        assert_eq!(Step::from_code(EXIT_EXHAUSTED), None);
        assert!(Step::Attach.is_privilege());
        assert!(!Step::PokeControl.is_privilege());
    }

    #[test]
    fn report_preserves_registers() {
        let regs = DebugRegisters {
            address: [0x10, 0x20, 0x30, 0x40],
            status: 0b1000,
            control: 0x40,
        };
        assert_eq!(decode_report(&encode_report(&regs)), regs);
    }
}
