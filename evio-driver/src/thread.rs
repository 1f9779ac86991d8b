use std::{
    collections::VecDeque,
    ops::Deref,
    rc::Rc,
    sync::{Arc, Mutex},
};

use crate::{
    handle::Handle,
    queue::{NotifyData, QueueInner},
    sys::ThreadSignal,
    Status,
};

pub(crate) type SendTask = Box<dyn FnOnce() + Send>;
pub(crate) type LocalTask = Box<dyn FnOnce()>;

/// Cross-thread mailbox of a thread handle: a task queue plus the backend
/// primitive that wakes the owning loop.
pub(crate) enum Mailbox {
    Locked {
        queue: Mutex<VecDeque<SendTask>>,
        signal: ThreadSignal,
    },
    /// io_uring futex fast path: the word is both the queue lock and the
    /// wakeup signal.
    #[cfg(io_uring)]
    Futex(crate::sys::iour::futex::FutexQueue<VecDeque<SendTask>>),
}

impl Mailbox {
    pub(crate) fn push(&self, task: SendTask) -> Status {
        match self {
            Mailbox::Locked { queue, signal } => {
                let Ok(mut queue) = queue.lock() else {
                    return Status::ErrorUnknown;
                };
                queue.push_back(task);
                drop(queue);
                signal.signal()
            }
            #[cfg(io_uring)]
            Mailbox::Futex(fx) => {
                fx.client_lock().push_back(task);
                // Guard drop wakes the waiting server.
                Status::Ok
            }
        }
    }

    /// Wake the loop without enqueueing anything.
    pub(crate) fn ring(&self) -> Status {
        match self {
            Mailbox::Locked { signal, .. } => signal.signal(),
            #[cfg(io_uring)]
            Mailbox::Futex(fx) => {
                fx.client_lock();
                Status::Ok
            }
        }
    }

    /// Whether any task is waiting. Used after a rearm to recover signals
    /// raised while the handle was suspended.
    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Mailbox::Locked { queue, .. } => queue.lock().map(|q| q.is_empty()).unwrap_or(true),
            // The futex word keeps its SIGNAL bit across suspension; the
            // rearmed wait observes it without any help.
            #[cfg(io_uring)]
            Mailbox::Futex(_) => false,
        }
    }

    /// Take every queued task. On the futex path this may observe a busy
    /// producer and return nothing; the unlock will wake the loop again.
    pub(crate) fn drain(&self) -> VecDeque<SendTask> {
        match self {
            Mailbox::Locked { queue, .. } => queue
                .lock()
                .map(|mut queue| std::mem::take(&mut *queue))
                .unwrap_or_default(),
            #[cfg(io_uring)]
            Mailbox::Futex(fx) => match fx.server_try_lock() {
                Some(mut queue) => std::mem::take(&mut *queue),
                None => VecDeque::new(),
            },
        }
    }
}

/// Per-arming state of a thread handle.
pub(crate) struct ThreadSource {
    pub mailbox: Arc<Mailbox>,
    /// Same-thread fallback queue; no lock, drained on the next wakeup.
    pub local: VecDeque<LocalTask>,
    /// Event descriptor registered with the backend, when one is used.
    #[cfg(any(epoll_like, io_uring))]
    pub fd: Option<Arc<std::os::fd::OwnedFd>>,
    /// Landing pad for in-flight kernel reads of the descriptor.
    #[cfg(io_uring)]
    pub read_buf: u64,
    /// User-event identity on the kqueue backend.
    #[cfg(kqueue_like)]
    pub ident: usize,
    /// Completion key the producers post on the IOCP backend.
    #[cfg(windows)]
    pub key: usize,
}

/// The `Send + Sync` producer side of a [`ThreadHandle`].
///
/// [`perform`](ThreadSender::perform) may be called from any thread; the
/// task runs on the thread that owns the handle's queue, in FIFO order per
/// submitting thread.
#[derive(Clone)]
pub struct ThreadSender {
    pub(crate) mailbox: Arc<Mailbox>,
}

impl ThreadSender {
    /// Enqueue `f` to run on the owning loop and wake it.
    pub fn perform(&self, f: impl FnOnce() + Send + 'static) -> Status {
        self.mailbox.push(Box::new(f))
    }

    /// Wake the owning loop without enqueueing a task.
    pub fn wake(&self) -> Status {
        self.mailbox.ring()
    }
}

/// A cross-thread wakeup handle created with [`Queue::add_thread_handle`].
///
/// Dereferences to [`Handle`]. Producers use a [`ThreadSender`] obtained
/// from [`sender`](ThreadHandle::sender); the owning thread may enqueue
/// through [`perform`](ThreadHandle::perform) without paying for the lock.
///
/// [`Queue::add_thread_handle`]: crate::Queue::add_thread_handle
#[derive(Clone)]
pub struct ThreadHandle {
    pub(crate) handle: Handle,
}

impl Deref for ThreadHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl ThreadHandle {
    /// A cloneable producer handle for other threads.
    pub fn sender(&self) -> ThreadSender {
        let mut source = self.handle.cell.source.borrow_mut();
        ThreadSender {
            mailbox: source.as_thread().mailbox.clone(),
        }
    }

    /// Enqueue `f` from the owning thread. The task is parked on the
    /// lock-free local queue and runs on the next loop iteration.
    pub fn perform(&self, f: impl FnOnce() + 'static) -> Status {
        let mailbox = {
            let mut source = self.handle.cell.source.borrow_mut();
            let thread = source.as_thread();
            thread.local.push_back(Box::new(f));
            thread.mailbox.clone()
        };
        mailbox.ring()
    }

    /// Drain and run every queued task right now, on the owning thread.
    /// Returns the number of tasks executed.
    pub fn drain(&self) -> u32 {
        run_queued(&self.handle)
    }
}

fn run_queued(handle: &Handle) -> u32 {
    let (mailbox, locals) = {
        let mut source = handle.cell.source.borrow_mut();
        let thread = source.as_thread();
        (thread.mailbox.clone(), std::mem::take(&mut thread.local))
    };
    let tasks = mailbox.drain();
    let mut nevents = 0;
    for task in tasks {
        task();
        nevents += 1;
    }
    for task in locals {
        task();
        nevents += 1;
    }
    nevents
}

/// Thread event dispatch: drain the mailbox and the local queue, then put
/// the wakeup primitive back to sleep.
pub(crate) fn notify(queue: &Rc<QueueInner>, handle: &Handle, data: NotifyData) {
    if handle.status() != Status::Ok {
        return;
    }

    if data.result < 0 {
        handle.cancel_with(Status::from_os_error(-data.result as i32), 0);
        return;
    }

    run_queued(handle);

    if handle.status() == Status::Ok && data.rearm {
        queue.rearm_handle(handle);
    }
}
