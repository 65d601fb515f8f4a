#[cfg(target_pointer_width = "64")]
pub type Word = u64;
#[cfg(target_pointer_width = "32")]
pub type Word = u32;

use crate::breakpoint::hardware::Spec;
use crate::codec::{self, Slot};

pub const MAX_BREAKPOINTS: usize = 4;

pub const DEBUG_STATUS_REG: usize = 6;
pub const DEBUG_CONTROL_REG: usize = 7;

/// Registers as they are laid out in the tracee's user area, in the order a
/// snapshot is read back.
pub const SNAPSHOT_REGISTERS: [usize; 6] = [0, 1, 2, 3, DEBUG_STATUS_REG, DEBUG_CONTROL_REG];

/// A copy of one thread's debug registers.
///
/// Every editor backend reads one of these, mutates it through [`arm`] or
/// [`disarm`], and writes it back; the bit layout itself lives in
/// [`crate::codec`].
///
/// [`arm`]: DebugRegisters::arm
/// [`disarm`]: DebugRegisters::disarm
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DebugRegisters {
    pub address: [Word; MAX_BREAKPOINTS],
    pub status: Word,
    pub control: Word,
}

impl DebugRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the first free slot for `spec`, leaving the other slots as
    /// they were. Returns `None` when all slots are enabled, in which case
    /// nothing is modified.
    pub fn arm(&mut self, spec: &Spec) -> Option<Slot> {
        let slot = codec::allocate_slot(self.control)?;

        self.address[slot.index()] = spec.address();
        self.control = codec::encode_slot(self.control, slot, spec.kind(), spec.size());

        Some(slot)
    }

    /// Disables `slot`; its address register is left as-is.
    pub fn disarm(&mut self, slot: Slot) {
        self.control = codec::clear_slot(self.control, slot);
    }

    pub fn triggered(&self) -> Option<(Slot, Word)> {
        codec::decode_trigger(self.status).map(|slot| (slot, self.address[slot.index()]))
    }

    pub fn register(&self, id: usize) -> Option<Word> {
        match id {
            0..=3 => Some(self.address[id]),
            DEBUG_STATUS_REG => Some(self.status),
            DEBUG_CONTROL_REG => Some(self.control),
            _ => None,
        }
    }

    pub fn register_mut(&mut self, id: usize) -> Option<&mut Word> {
        match id {
            0..=3 => Some(&mut self.address[id]),
            DEBUG_STATUS_REG => Some(&mut self.status),
            DEBUG_CONTROL_REG => Some(&mut self.control),
            _ => None,
        }
    }

    pub fn to_words(&self) -> [Word; 6] {
        let mut words = [0; 6];
        for (word, id) in words.iter_mut().zip(SNAPSHOT_REGISTERS.iter()) {
            *word = self.register(*id).unwrap_or(0);
        }
        words
    }

    pub fn from_words(words: &[Word; 6]) -> Self {
        let mut regs = Self::default();
        for (word, id) in words.iter().zip(SNAPSHOT_REGISTERS.iter()) {
            if let Some(reg) = regs.register_mut(*id) {
                *reg = *word;
            }
        }
        regs
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub(crate) fn debug_offset(id: usize) -> Word {
    (std::mem::offset_of!(libc::user, u_debugreg) + id * std::mem::size_of::<Word>()) as Word
}
