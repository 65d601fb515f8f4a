pub mod arch;
pub mod breakpoint;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod editor;
pub mod error;
#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
mod util;

pub use arch::Word;
pub use breakpoint::hardware::{Kind, Size, Spec};
pub use breakpoint::{Breakpoint, State};
pub use codec::Slot;
pub use config::{Backend, Config};
pub use dispatch::{Disposition, Handler};
pub use editor::{Editor, Tid};
pub use error::Error;

#[cfg(unix)]
pub use nix::Error as SystemError;

/// Arms a breakpoint on the calling thread using the platform's editor.
pub fn set_breakpoint(kind: Kind, address: Word, size: usize) -> Result<Breakpoint, Error> {
    let spec = Spec::new(kind, address, Size::from_bytes(size)?)?;

    let mut bp = Breakpoint::new(spec, editor::native());
    bp.attach()?;

    Ok(bp)
}

pub fn clear_breakpoint(mut bp: Breakpoint) -> Result<(), Error> {
    bp.detach()
}

/// Registers the process-wide trap handler; `None` removes it.
pub fn set_breakpoint_handler(handler: Option<Handler>) -> Result<(), Error> {
    dispatch::set_handler(handler)
}
