use std::{ops::Deref, rc::Rc};

use bitflags::bitflags;

use crate::{
    handle::Handle,
    queue::{NotifyData, QueueInner},
    RawFd, Status,
};

bitflags! {
    /// Readiness conditions of a pollable OS handle.
    ///
    /// The low bits match the portable `poll(2)` constants; completions
    /// carry the set of conditions that are actually ready.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u16 {
        /// Readable.
        const IN = 0x001;
        /// Exceptional condition (e.g. out-of-band data).
        const PRI = 0x002;
        /// Writable.
        const OUT = 0x004;
        /// Error condition. Reported even when not requested.
        const ERR = 0x008;
        /// Peer hung up. Reported even when not requested.
        const HUNG_UP = 0x010;
        /// The descriptor is invalid.
        const INVALID = 0x020;

        /// Close the descriptor when the handle is cancelled.
        const CLOSE_FD = 0x4000;
        /// Keep the kernel registration alive across deliveries where the
        /// backend supports it (io_uring multishot poll).
        const ALLOW_MULTI = 0x8000;

        /// Bits that can appear in a completion value.
        const POLL_MASK = 0x3FFF;
    }
}

impl PollFlags {
    pub(crate) fn events(self) -> PollFlags {
        self & PollFlags::POLL_MASK
    }
}

/// Per-arming state of a poll handle.
pub(crate) struct PollSource {
    pub fd: RawFd,
    pub flags: PollFlags,
    /// Registered wait associating the object with the port.
    #[cfg(windows)]
    pub wait: std::os::windows::io::RawHandle,
}

/// A readiness watch created with [`Queue::listen_pollable`].
///
/// Dereferences to [`Handle`]; the completion value is the [`PollFlags`]
/// bitmask of ready conditions. A handle that reports `ERR` or `HUNG_UP` is
/// cancelled with `Done` right after the report.
///
/// [`Queue::listen_pollable`]: crate::Queue::listen_pollable
#[derive(Clone)]
pub struct PollHandle {
    pub(crate) handle: Handle,
}

impl Deref for PollHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl PollHandle {
    /// The descriptor this handle watches.
    pub fn fd(&self) -> RawFd {
        self.handle.cell.source.borrow_mut().as_poll().fd
    }
}

/// Poll event dispatch: report the ready bits, then auto-cancel on
/// error-like readiness or rearm a consumed registration.
pub(crate) fn notify(queue: &Rc<QueueInner>, handle: &Handle, data: NotifyData) {
    if handle.status() != Status::Ok {
        return;
    }

    if data.result < 0 {
        handle.cancel_with(Status::from_os_error(-data.result as i32), 0);
        return;
    }

    let ready = PollFlags::from_bits_truncate(data.flags as u16).events();
    handle.send_completion(ready.bits() as u32, Status::Ok);

    if handle.status() != Status::Ok {
        return;
    }

    if ready.intersects(PollFlags::ERR | PollFlags::HUNG_UP | PollFlags::INVALID) {
        handle.cancel_with(Status::Done, ready.bits() as u32);
    } else if data.rearm {
        queue.rearm_handle(handle);
    }
}
