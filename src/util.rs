use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{AddressType, Request, RequestType};
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use std::os::raw::{c_long, c_void};

use crate::editor::Tid;

pub trait AsPid {
    fn as_pid(self) -> Pid;
}

impl AsPid for Pid {
    fn as_pid(self) -> Pid {
        self
    }
}

impl AsPid for Tid {
    fn as_pid(self) -> Pid {
        Pid::from_raw(self.as_raw() as libc::pid_t)
    }
}

#[repr(transparent)]
pub struct AddressLike(AddressType);

impl From<i32> for AddressLike {
    fn from(t: i32) -> Self {
        Self(t as _)
    }
}

impl From<u32> for AddressLike {
    fn from(t: u32) -> Self {
        Self(t as _)
    }
}

impl From<u64> for AddressLike {
    fn from(t: u64) -> Self {
        Self(t as _)
    }
}

#[repr(transparent)]
pub struct DataLike(*mut c_void);

impl From<i32> for DataLike {
    fn from(t: i32) -> Self {
        Self(t as _)
    }
}

impl From<u32> for DataLike {
    fn from(t: u32) -> Self {
        Self(t as _)
    }
}

impl From<u64> for DataLike {
    fn from(t: u64) -> Self {
        Self(t as _)
    }
}

/// Raw `ptrace(2)`; the value of a `PEEK*` request is the `Ok` payload, so
/// `errno` is cleared first to tell a peeked `-1` from a failure.
pub(crate) fn ptrace<A, D>(request: Request, pid: Pid, addr: A, data: D) -> nix::Result<c_long>
where
    A: Into<AddressLike>,
    D: Into<DataLike>,
{
    let addr = addr.into();
    let data = data.into();

    unsafe {
        Errno::clear();
        let res = libc::ptrace(request as RequestType, libc::pid_t::from(pid), addr.0, data.0);
        if res == -1 && Errno::last() != Errno::UnknownErrno {
            Err(nix::Error::from(Errno::last()))
        } else {
            Ok(res)
        }
    }
}

/// `waitpid(2)`, restarted when interrupted.
pub(crate) fn waitpid(pid: Pid, options: Option<WaitPidFlag>) -> nix::Result<(WaitStatus, i32)> {
    let mut status = 0;
    let option_bits = match options {
        Some(bits) => bits.bits(),
        None => 0,
    };

    loop {
        let res = unsafe { libc::waitpid(pid.as_raw(), &mut status as *mut _, option_bits) };

        match Errno::result(res) {
            Err(_) if Errno::last() == Errno::EINTR => continue,
            Err(e) => return Err(e),
            Ok(0) => return Ok((WaitStatus::StillAlive, status)),
            Ok(res) => {
                return WaitStatus::from_raw(Pid::from_raw(res), status).map(|r| (r, status))
            }
        }
    }
}
