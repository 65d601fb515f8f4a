//! Win32 thread primitives for the handshake editor.

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{
    GetThreadContext, SetThreadContext, CONTEXT, CONTEXT_DEBUG_REGISTERS_AMD64,
};
use windows::Win32::System::Threading::{OpenThread, ResumeThread, SuspendThread, THREAD_ALL_ACCESS};

use crate::arch::DebugRegisters;
use crate::editor::handshake::ThreadBackend;
use crate::editor::Tid;
use crate::error::Error;

pub struct ThreadHandle {
    handle: HANDLE,
    tid: Tid,
}

// a thread handle is a kernel object reference, usable from any thread
unsafe impl Send for ThreadHandle {}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsThreads;

impl WindowsThreads {
    fn context() -> CONTEXT {
        CONTEXT {
            ContextFlags: CONTEXT_DEBUG_REGISTERS_AMD64,
            ..Default::default()
        }
    }
}

impl ThreadBackend for WindowsThreads {
    type Handle = ThreadHandle;

    fn open(&self, target: Tid) -> Result<ThreadHandle, Error> {
        let handle = unsafe { OpenThread(THREAD_ALL_ACCESS, false, target.as_raw() as u32) }
            .map_err(|e| Error::Privilege(target, format!("OpenThread failed: {}", e)))?;

        Ok(ThreadHandle { handle, tid: target })
    }

    fn suspend(&self, handle: &ThreadHandle) -> Result<(), Error> {
        if unsafe { SuspendThread(handle.handle) } == u32::MAX {
            return Err(Error::Thread(handle.tid, "SuspendThread failed"));
        }
        Ok(())
    }

    fn resume(&self, handle: &ThreadHandle) -> Result<(), Error> {
        if unsafe { ResumeThread(handle.handle) } == u32::MAX {
            return Err(Error::Thread(handle.tid, "ResumeThread failed"));
        }
        Ok(())
    }

    fn read(&self, handle: &ThreadHandle) -> Result<DebugRegisters, Error> {
        let mut context = Self::context();

        unsafe { GetThreadContext(handle.handle, &mut context) }
            .map_err(|_| Error::Context(handle.tid, "GetThreadContext failed"))?;

        Ok(DebugRegisters {
            address: [context.Dr0, context.Dr1, context.Dr2, context.Dr3],
            status: context.Dr6,
            control: context.Dr7,
        })
    }

    fn write(&self, handle: &ThreadHandle, regs: &DebugRegisters) -> Result<(), Error> {
        let mut context = Self::context();
        context.Dr0 = regs.address[0];
        context.Dr1 = regs.address[1];
        context.Dr2 = regs.address[2];
        context.Dr3 = regs.address[3];
        context.Dr6 = regs.status;
        context.Dr7 = regs.control;

        unsafe { SetThreadContext(handle.handle, &context) }
            .map_err(|_| Error::Context(handle.tid, "SetThreadContext failed"))
    }
}
