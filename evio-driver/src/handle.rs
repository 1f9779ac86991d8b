use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use crate::{
    pollable::PollSource,
    queue::QueueInner,
    thread::ThreadSource,
    timer::TimerSource,
    Status,
};

pub(crate) type CompletionFn = Rc<dyn Fn(&Handle, u32, Status)>;

/// The handle kind, fixed at construction. It selects which notification
/// routine the queue dispatches to; it never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Timer,
    Poll,
    Thread,
}

/// Backend state of one handle. The variant always matches the handle kind.
pub(crate) enum Source {
    Timer(TimerSource),
    Poll(PollSource),
    Thread(ThreadSource),
}

impl Source {
    pub(crate) fn as_timer(&mut self) -> &mut TimerSource {
        match self {
            Source::Timer(s) => s,
            _ => unreachable!("handle kind mismatch"),
        }
    }

    pub(crate) fn as_poll(&mut self) -> &mut PollSource {
        match self {
            Source::Poll(s) => s,
            _ => unreachable!("handle kind mismatch"),
        }
    }

    pub(crate) fn as_thread(&mut self) -> &mut ThreadSource {
        match self {
            Source::Thread(s) => s,
            _ => unreachable!("handle kind mismatch"),
        }
    }
}

pub(crate) struct HandleCell {
    pub(crate) queue: Weak<QueueInner>,
    pub(crate) kind: HandleKind,
    pub(crate) status: Cell<Status>,
    pub(crate) timeline: Cell<u32>,
    /// Backend registration slot while armed.
    pub(crate) token: Cell<Option<usize>>,
    completion: RefCell<Option<CompletionFn>>,
    userdata: RefCell<Option<Rc<dyn Any>>>,
    pub(crate) source: RefCell<Source>,
}

/// A reference-counted asynchronous operation owned by a [`Queue`].
///
/// A handle starts `Pending`, moves to `Ok` when armed, to `Suspended` when
/// the queue quiesces it, to `Declined` when paused by the user, and ends in
/// a terminal status (`Done` or an error) set by [`cancel`]. The completion
/// callback fires once per delivered event and exactly once with the
/// terminal status.
///
/// Handles are manipulated only on the thread of the queue that created
/// them; the cross-thread surfaces are [`ThreadSender`] and [`QueueWaker`].
///
/// [`Queue`]: crate::Queue
/// [`cancel`]: Handle::cancel
/// [`ThreadSender`]: crate::ThreadSender
/// [`QueueWaker`]: crate::QueueWaker
#[derive(Clone)]
pub struct Handle {
    pub(crate) cell: Rc<HandleCell>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.cell.kind)
            .field("status", &self.status())
            .field("timeline", &self.timeline())
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(
        queue: &Rc<QueueInner>,
        kind: HandleKind,
        source: Source,
        completion: Option<CompletionFn>,
    ) -> Self {
        Self {
            cell: Rc::new(HandleCell {
                queue: Rc::downgrade(queue),
                kind,
                status: Cell::new(Status::Pending),
                timeline: Cell::new(0),
                token: Cell::new(None),
                completion: RefCell::new(completion),
                userdata: RefCell::new(None),
                source: RefCell::new(source),
            }),
        }
    }

    /// The current lifecycle status.
    pub fn status(&self) -> Status {
        self.cell.status.get()
    }

    /// The arming-epoch counter. Incremented on every disarm; stale kernel
    /// completions carrying an older snapshot are discarded.
    pub fn timeline(&self) -> u32 {
        self.cell.timeline.get()
    }

    /// Whether the handle supports [`pause`]/[`resume`] and graceful
    /// suspension.
    ///
    /// [`pause`]: Handle::pause
    /// [`resume`]: Handle::resume
    pub fn is_resumable(&self) -> bool {
        // Every kind of the current backends can disarm and rearm.
        true
    }

    /// Anchor caller-side state to the handle for the rest of its life.
    pub fn set_userdata(&self, data: Rc<dyn Any>) {
        *self.cell.userdata.borrow_mut() = Some(data);
    }

    /// The anchored caller-side state, if any.
    pub fn userdata(&self) -> Option<Rc<dyn Any>> {
        self.cell.userdata.borrow().clone()
    }

    /// Pause the handle. It stays registered but will not rearm on queue
    /// wakeups; cancel it to release it, or [`resume`] it to continue.
    ///
    /// [`resume`]: Handle::resume
    pub fn pause(&self) -> Status {
        if !self.is_resumable() {
            return Status::ErrorNotSupported;
        }
        match self.status() {
            Status::Suspended => {
                // Temporarily suspended by the queue; mark as user-paused so
                // resume_all skips it.
                self.cell.status.set(Status::Declined);
                Status::Ok
            }
            Status::Ok => {
                let Some(queue) = self.cell.queue.upgrade() else {
                    return Status::ErrorNoSuchProcess;
                };
                let status = queue.suspend_handle(self);
                if status != Status::Ok {
                    evio_log::error!("failed to pause handle: {status}");
                    return status;
                }
                self.cell.status.set(Status::Declined);
                Status::Ok
            }
            _ => Status::ErrorNoSuchProcess,
        }
    }

    /// Resume a paused or suspended handle.
    pub fn resume(&self) -> Status {
        if !self.is_resumable() {
            return Status::ErrorNotSupported;
        }
        match self.status() {
            Status::Suspended | Status::Declined => {
                let Some(queue) = self.cell.queue.upgrade() else {
                    return Status::ErrorNoSuchProcess;
                };
                queue.resume_handle(self)
            }
            _ => Status::ErrorNoSuchProcess,
        }
    }

    /// Cancel with [`Status::ErrorCancelled`].
    pub fn cancel(&self) -> Status {
        self.cancel_with(Status::ErrorCancelled, 0)
    }

    /// Move the handle to a terminal status and fire the completion exactly
    /// once with `(value, status)`.
    ///
    /// `status` must be [`Status::Done`] or an error; anything else is
    /// refused with `ErrorInvalidArgument`. Cancelling an already terminal
    /// handle returns `ErrorAlreadyPerformed`.
    pub fn cancel_with(&self, status: Status, value: u32) -> Status {
        if !status.is_valid_cancel() {
            evio_log::warn!(
                "Handle::cancel_with expects Done or an error status, got {status}; refused"
            );
            return Status::ErrorInvalidArgument;
        }
        let Some(queue) = self.cell.queue.upgrade() else {
            // The queue is gone: finish locally so the completion contract
            // still holds for a handle that had reached Ok.
            if self.status().is_valid_cancel() || self.status() == Status::Pending {
                return Status::ErrorAlreadyPerformed;
            }
            self.cell.status.set(status);
            self.finalize(value, status);
            return Status::Ok;
        };
        queue.cancel_handle(self, status, value)
    }

    /// Identity of the underlying cell, used as a map key.
    pub(crate) fn key(&self) -> usize {
        Rc::as_ptr(&self.cell) as usize
    }

    pub(crate) fn kind(&self) -> HandleKind {
        self.cell.kind
    }

    pub(crate) fn same_handle(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn replace_completion(&self, completion: CompletionFn) {
        *self.cell.completion.borrow_mut() = Some(completion);
        *self.cell.userdata.borrow_mut() = None;
    }

    /// Fire the completion without consuming it. The callback is cloned out
    /// of the slot first, so it may re-enter the handle (including a
    /// self-cancel, which takes the slot and fires the terminal completion
    /// from within this call).
    pub(crate) fn send_completion(&self, value: u32, status: Status) {
        let completion = self.cell.completion.borrow().clone();
        if let Some(completion) = completion {
            completion(self, value, status);
        }
    }

    /// Fire the terminal completion and drop the callback; later calls are
    /// no-ops.
    pub(crate) fn finalize(&self, value: u32, status: Status) {
        let completion = self.cell.completion.borrow_mut().take();
        if let Some(completion) = completion {
            completion(self, value, status);
        }
    }

    pub(crate) fn bump_timeline(&self) {
        self.cell.timeline.set(self.cell.timeline.get().wrapping_add(1));
    }
}
