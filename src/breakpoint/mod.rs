pub mod hardware;

use tracing::{debug, warn};

use crate::codec::Slot;
use crate::editor::{self, DynEditor, Editor, Tid};
use crate::error::Error;

use self::hardware::Spec;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    Created,
    Attaching,
    Armed,
    Detaching,
    Cleared,
    /// Attach failed; the breakpoint cannot be reused.
    Failed,
}

/// A hardware breakpoint bound to one thread.
///
/// The breakpoint owns its slot while `Armed`; dropping an armed breakpoint
/// disarms it on a best-effort basis.
pub struct Breakpoint<E: Editor = DynEditor> {
    spec: Spec,
    target: Tid,
    slot: Option<Slot>,
    state: State,
    editor: E,
}

impl<E: Editor> Breakpoint<E> {
    /// A breakpoint on the calling thread.
    pub fn new(spec: Spec, editor: E) -> Self {
        Self::for_thread(spec, Tid::current(), editor)
    }

    pub fn for_thread(spec: Spec, target: Tid, editor: E) -> Self {
        Self {
            spec,
            target,
            slot: None,
            state: State::Created,
            editor,
        }
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn target(&self) -> Tid {
        self.target
    }

    pub fn slot(&self) -> Option<Slot> {
        self.slot
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn enabled(&self) -> bool {
        self.state == State::Armed
    }

    fn require(&self, expected: State) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    pub fn attach(&mut self) -> Result<Slot, Error> {
        self.require(State::Created)?;
        self.state = State::Attaching;

        let result = {
            let _edit = editor::exclusive();
            self.editor.attach(self.target, &self.spec)
        };

        match result {
            Ok(slot) => {
                self.slot = Some(slot);
                self.state = State::Armed;
                Ok(slot)
            }
            Err(e) => {
                self.state = State::Failed;
                warn!(thread = %self.target, "unable to arm breakpoint at {:#x}: {}", self.spec.address(), e);
                Err(e)
            }
        }
    }

    /// Disarms the breakpoint. On failure it stays `Armed`, so the caller may
    /// retry.
    pub fn detach(&mut self) -> Result<(), Error> {
        self.require(State::Armed)?;

        let slot = match self.slot {
            Some(slot) => slot,
            None => {
                return Err(Error::InvalidState {
                    expected: State::Armed,
                    found: self.state,
                })
            }
        };

        self.state = State::Detaching;

        let result = {
            let _edit = editor::exclusive();
            self.editor.detach(self.target, &self.spec, slot)
        };

        match result {
            Ok(()) => {
                self.slot = None;
                self.state = State::Cleared;
                debug!(thread = %self.target, %slot, "breakpoint cleared");
                Ok(())
            }
            Err(e) => {
                self.state = State::Armed;
                warn!(thread = %self.target, %slot, "unable to disarm breakpoint: {}", e);
                Err(e)
            }
        }
    }
}

impl<E: Editor> Drop for Breakpoint<E> {
    fn drop(&mut self) {
        if self.state == State::Armed {
            if let Err(e) = self.detach() {
                warn!(thread = %self.target, "breakpoint at {:#x} left armed on drop: {}", self.spec.address(), e);
            }
        }
    }
}
