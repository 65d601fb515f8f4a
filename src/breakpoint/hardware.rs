use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::arch::Word;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to set breakpoint using specified size {0}")]
    InvalidSize(usize),
    #[error("unable to set {kind} breakpoint with size {size}; only 1-byte length is supported")]
    InvalidLength { kind: Kind, size: Size },
    #[error("unable to set breakpoint at {address:#x}; address is not aligned to size {size}")]
    Misaligned { address: Word, size: Size },
    #[error("unknown breakpoint kind `{0}`")]
    UnknownKind(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
    Execute,
    Write,
    /// Read or write.
    Access,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Execute => "execute",
            Self::Write => "write",
            Self::Access => "access",
        })
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execute" | "exec" | "x" => Ok(Self::Execute),
            "write" | "w" => Ok(Self::Write),
            "access" | "rw" => Ok(Self::Access),
            _ => Err(Error::UnknownKind(s.to_owned())),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Size {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl Size {
    pub fn from_bytes(size: usize) -> Result<Self, Error> {
        match size {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            #[cfg(target_pointer_width = "64")]
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidSize(size)),
        }
    }

    pub fn bytes(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// What a hardware breakpoint watches: an address, the kind of access and
/// the width of the watched range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Spec {
    address: Word,
    kind: Kind,
    size: Size,
}

impl Spec {
    pub fn new(kind: Kind, address: Word, size: Size) -> Result<Self, Error> {
        if kind == Kind::Execute && size != Size::One {
            return Err(Error::InvalidLength { kind, size });
        }

        #[cfg(target_pointer_width = "32")]
        {
            if size == Size::Eight {
                return Err(Error::InvalidSize(size.bytes()));
            }
        }

        if address % size.bytes() as Word != 0 {
            return Err(Error::Misaligned { address, size });
        }

        Ok(Self {
            address,
            kind,
            size,
        })
    }

    pub fn address(&self) -> Word {
        self.address
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Whether the range `[address, address + len)` overlaps the watched range.
    /// Ranges running past the top of the address space are clamped to it.
    pub fn covers(&self, address: Word, len: usize) -> bool {
        if len == 0 {
            return false;
        }

        let start = self.address;
        let last = start.saturating_add(self.size.bytes() as Word - 1);
        let other_last = address.saturating_add(len as Word - 1);

        address <= last && start <= other_last
    }
}
