//! Bit-level encoding of the debug control (DR7) and status (DR6) words.
//!
//! Everything here is a pure function over a [`Word`]; nothing touches a
//! thread or a register.

use bitflags::bitflags;
use std::fmt;

use crate::arch::{Word, MAX_BREAKPOINTS};
use crate::breakpoint::hardware::{Kind, Size};

/// One of the four hardware breakpoint slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(usize);

impl Slot {
    pub const ALL: [Slot; MAX_BREAKPOINTS] = [Slot(0), Slot(1), Slot(2), Slot(3)];

    pub fn new(index: usize) -> Option<Self> {
        if index < MAX_BREAKPOINTS {
            Some(Self(index))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dr{}", self.0)
    }
}

bitflags! {
    pub struct Status: Word {
        const B0 = 0x0001;
        const B1 = 0x0002;
        const B2 = 0x0004;
        const B3 = 0x0008;
        const BD = 0x2000;
        const BS = 0x4000;
        const BT = 0x8000;

        const TRIGGERS = Self::B0.bits | Self::B1.bits | Self::B2.bits | Self::B3.bits;
    }
}

const fn enable_field_shift(i: usize) -> u32 {
    (i * 2) as u32
}

const fn kind_field_shift(i: usize) -> u32 {
    (i * 4 + 16) as u32
}

const fn len_field_shift(i: usize) -> u32 {
    (i * 4 + 18) as u32
}

#[inline(always)]
fn enable_bit(slot: Slot) -> Word {
    (1 as Word) << enable_field_shift(slot.index())
}

#[inline(always)]
fn field_mask(slot: Slot) -> Word {
    ((0b11 as Word) << kind_field_shift(slot.index())) | ((0b11 as Word) << len_field_shift(slot.index()))
}

pub(crate) fn kind_field(kind: Kind) -> u8 {
    match kind {
        Kind::Execute => 0b00,
        Kind::Write => 0b01,
        Kind::Access => 0b11,
    }
}

pub(crate) fn len_field(size: Size) -> u8 {
    match size {
        Size::One => 0b00,
        Size::Two => 0b01,
        Size::Four => 0b11,
        Size::Eight => 0b10,
    }
}

pub fn slot_enabled(control: Word, slot: Slot) -> bool {
    control & enable_bit(slot) != 0
}

/// Kind programmed into `slot`; meaningless unless the slot is enabled.
pub fn slot_kind(control: Word, slot: Slot) -> Option<Kind> {
    match (control >> kind_field_shift(slot.index())) & 0b11 {
        0b00 => Some(Kind::Execute),
        0b01 => Some(Kind::Write),
        0b11 => Some(Kind::Access),
        _ => None, // I/O breakpoints
    }
}

pub fn armed_slots(control: Word) -> impl Iterator<Item = Slot> {
    (0..MAX_BREAKPOINTS)
        .map(Slot)
        .filter(move |slot| slot_enabled(control, *slot))
}

/// First slot whose enable bit is clear.
pub fn allocate_slot(control: Word) -> Option<Slot> {
    (0..MAX_BREAKPOINTS)
        .map(Slot)
        .find(|slot| !slot_enabled(control, *slot))
}

pub fn encode_slot(control: Word, slot: Slot, kind: Kind, size: Size) -> Word {
    let fields = ((kind_field(kind) as Word) << kind_field_shift(slot.index()))
        | ((len_field(size) as Word) << len_field_shift(slot.index()));

    (control & !field_mask(slot)) | enable_bit(slot) | fields
}

/// Clears only the enable bit; the kind and length fields go stale.
pub fn clear_slot(control: Word, slot: Slot) -> Word {
    control & !enable_bit(slot)
}

/// Slot named by the lowest B0..B3 bit of a status word.
pub fn decode_trigger(status: Word) -> Option<Slot> {
    let triggered = (Status::from_bits_truncate(status) & Status::TRIGGERS).bits();
    if triggered == 0 {
        None
    } else {
        Slot::new(triggered.trailing_zeros() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(i: usize) -> Slot {
        Slot::new(i).unwrap()
    }

    #[test]
    fn encode_places_fields() {
        assert_eq!(encode_slot(0, slot(0), Kind::Write, Size::Four), 0x000d_0001);
        assert_eq!(encode_slot(0, slot(1), Kind::Access, Size::One), 0x0030_0004);
        assert_eq!(encode_slot(0, slot(2), Kind::Execute, Size::One), 0x0000_0010);
        assert_eq!(encode_slot(0, slot(3), Kind::Access, Size::Eight), 0xb000_0040);
    }

    #[test]
    fn encode_preserves_other_slots() {
        let word = encode_slot(0, slot(0), Kind::Access, Size::Eight);
        let word = encode_slot(word, slot(2), Kind::Write, Size::Two);

        let rewritten = encode_slot(word, slot(1), Kind::Write, Size::Four);
        assert_eq!(rewritten & !(0b1111 << 20 | 0b11 << 2), word);

        // overwriting a slot replaces stale fields instead of or-ing into them
        let replaced = encode_slot(word, slot(0), Kind::Write, Size::One);
        assert_eq!(slot_kind(replaced, slot(0)), Some(Kind::Write));
        assert_eq!((replaced >> 18) & 0b11, 0b00);
        assert_eq!(replaced & !0xf_0003, word & !0xf_0003);
    }

    #[test]
    fn clear_only_touches_enable_bit() {
        let word = encode_slot(0, slot(1), Kind::Access, Size::Four);
        let word = encode_slot(word, slot(3), Kind::Write, Size::Four);

        let cleared = clear_slot(word, slot(1));
        assert_eq!(cleared, word & !0b100);
        assert!(!slot_enabled(cleared, slot(1)));
        assert!(slot_enabled(cleared, slot(3)));
    }

    #[test]
    fn allocation_is_first_free() {
        assert_eq!(allocate_slot(0), Some(slot(0)));
        assert_eq!(allocate_slot(0b0001), Some(slot(1)));
        assert_eq!(allocate_slot(0b0101), Some(slot(2)));
        assert_eq!(allocate_slot(0b0100), Some(slot(0)));
        assert_eq!(allocate_slot(0b0101_0101), None);

        // global-enable bits do not count as allocated
        assert_eq!(allocate_slot(0b1010_1010), Some(slot(0)));
    }

    #[test]
    fn armed_slots_lists_enabled() {
        let word = encode_slot(0, slot(0), Kind::Write, Size::Four);
        let word = encode_slot(word, slot(3), Kind::Write, Size::Four);
        assert_eq!(armed_slots(word).collect::<Vec<_>>(), vec![slot(0), slot(3)]);
    }

    #[test]
    fn decode_trigger_maps_bits() {
        assert_eq!(decode_trigger(0b0001), Some(slot(0)));
        assert_eq!(decode_trigger(0b0010), Some(slot(1)));
        assert_eq!(decode_trigger(0b0100), Some(slot(2)));
        assert_eq!(decode_trigger(0b1000), Some(slot(3)));
        assert_eq!(decode_trigger(0b1010), Some(slot(1)));
        assert_eq!(decode_trigger(0xffff_0ff0 & !0xf), None);
        assert_eq!(decode_trigger(Status::BS.bits()), None);
        assert_eq!(decode_trigger((Status::BS | Status::B3).bits()), Some(slot(3)));
        assert_eq!(decode_trigger(0), None);
    }
}
