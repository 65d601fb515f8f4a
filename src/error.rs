use thiserror::Error;

use crate::arch::{Word, MAX_BREAKPOINTS};
use crate::breakpoint::State;
use crate::editor::tracer::Step;
use crate::editor::Tid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("breakpoint: {0}")]
    Breakpoint(#[from] crate::breakpoint::hardware::Error),
    #[error("insufficient privilege to edit debug registers of thread {0}: {1}")]
    Privilege(Tid, String),
    #[error("unable to set breakpoint at {0:#x}; all {} slots are in use", MAX_BREAKPOINTS)]
    ResourceExhausted(Word),
    #[error("hardware breakpoints are not supported on this platform")]
    PlatformUnsupported,
    #[error("breakpoint is {found:?}; operation requires {expected:?}")]
    InvalidState { expected: State, found: State },
    #[error("tracer failed during {0:?}")]
    Tracer(Step),
    #[error("tracer terminated unexpectedly: {0}")]
    TracerTerminated(String),
    #[error("could not suspend or resume thread {0}: {1}")]
    Thread(Tid, &'static str),
    #[error("could not access register context of thread {0}: {1}")]
    Context(Tid, &'static str),
    #[error("register editor worker: {0}")]
    Worker(String),
    #[error("trap interceptor: {0}")]
    Interceptor(String),
    #[cfg(unix)]
    #[error("fatal: {0}")]
    System(#[from] nix::Error),
    #[error("configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
