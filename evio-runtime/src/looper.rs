use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::{Arc, Mutex, Weak},
    thread::ThreadId,
    time::Duration,
};

use evio_driver::{
    Handle, PollFlags, PollHandle, Queue, QueueEngine, QueueFlags, QueueInfo, QueueWakeupInfo,
    QueueWaker, RawFd, Status, ThreadHandle, ThreadSender, TimerHandle, TimerInfo, WakeupFlags,
};

use crate::{bus::Bus, pool::DispatchPool};

/// Parameters for [`Looper::acquire`].
#[derive(Debug, Clone)]
pub struct LooperInfo {
    /// Name used for the worker threads.
    pub name: String,
    /// Permitted queue backends.
    pub engine_mask: QueueEngine,
    /// Worker-thread limit of the lazily created pool.
    pub workers_count: usize,
}

impl Default for LooperInfo {
    fn default() -> Self {
        Self {
            name: "Looper".into(),
            engine_mask: QueueEngine::ANY,
            workers_count: 4,
        }
    }
}

/// State shared with other threads: the mailbox, the waker and the bus
/// registry used on teardown.
pub(crate) struct LooperShared {
    sender: ThreadSender,
    waker: QueueWaker,
    thread: ThreadId,
    buses: Mutex<Vec<Weak<Bus>>>,
}

impl LooperShared {
    pub(crate) fn attach_bus(&self, bus: &Arc<Bus>) {
        let mut buses = self.buses.lock().expect("bus registry poisoned");
        if !buses.iter().any(|b| b.ptr_eq(&Arc::downgrade(bus))) {
            buses.push(Arc::downgrade(bus));
        }
    }

    pub(crate) fn detach_bus(&self, bus: &Arc<Bus>) {
        let mut buses = self.buses.lock().expect("bus registry poisoned");
        buses.retain(|b| !b.ptr_eq(&Arc::downgrade(bus)));
    }
}

/// The `Send + Sync` surface of a [`Looper`], usable from any thread.
#[derive(Clone)]
pub struct LooperHandle {
    pub(crate) shared: Arc<LooperShared>,
}

impl LooperHandle {
    /// Whether the calling thread is the looper's thread.
    pub fn is_on_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.shared.thread
    }

    /// Run `f` on the looper thread, in mailbox FIFO order.
    pub fn perform(&self, f: impl FnOnce() + Send + 'static) -> Status {
        self.shared.sender.perform(f)
    }

    /// Stop the looper's innermost `run` from any thread.
    pub fn wakeup(&self, flags: WakeupFlags) -> Status {
        self.shared.waker.wakeup(flags)
    }

    pub(crate) fn attach_bus(&self, bus: &Arc<Bus>) {
        self.shared.attach_bus(bus);
    }

    pub(crate) fn detach_bus(&self, bus: &Arc<Bus>) {
        self.shared.detach_bus(bus);
    }
}

struct LooperInner {
    queue: Queue,
    thread_handle: ThreadHandle,
    pool: RefCell<Option<DispatchPool>>,
    pool_name: String,
    pool_limit: usize,
    shared: Arc<LooperShared>,
    suspend_threads_on_wakeup: Cell<bool>,
}

impl LooperInner {
    fn pool_dispatch(&self, f: impl FnOnce() + Send + 'static) -> Status {
        let mut pool = self.pool.borrow_mut();
        let pool = pool.get_or_insert_with(|| {
            DispatchPool::new(
                format!("{}:Worker", self.pool_name),
                self.pool_limit,
                Duration::from_secs(60),
            )
        });
        pool.dispatch(f)
    }

    fn cancel_pool(&self) {
        if let Some(pool) = self.pool.borrow_mut().take() {
            pool.cancel();
        }
    }
}

impl Drop for LooperInner {
    fn drop(&mut self) {
        // Flush completions that already arrived, then tear the parts down
        // in dependency order.
        self.queue.poll();

        let buses = std::mem::take(&mut *self.shared.buses.lock().expect("bus registry poisoned"));
        for bus in buses {
            if let Some(bus) = bus.upgrade() {
                bus.invalidate_looper(self.shared.thread);
            }
        }

        self.cancel_pool();
        self.thread_handle.cancel();
        self.queue.cancel();
    }
}

thread_local! {
    static TL_LOOPER: RefCell<Option<Looper>> = const { RefCell::new(None) };
}

/// A per-thread event loop: one [`Queue`], a cross-thread mailbox, a lazy
/// worker pool and the buses the thread listens on.
///
/// [`acquire`](Looper::acquire) returns the calling thread's looper,
/// creating it on first use. The looper is torn down when the thread (and
/// its thread-local storage) exits.
#[derive(Clone)]
pub struct Looper {
    inner: Rc<LooperInner>,
}

impl Looper {
    /// The current thread's looper, created on first call.
    pub fn acquire(info: LooperInfo) -> Result<Looper, Status> {
        if let Some(looper) = Self::current() {
            return Ok(looper);
        }

        let queue = Queue::create(QueueInfo {
            flags: QueueFlags::SUBMIT_IMMEDIATE | QueueFlags::THREAD_NATIVE,
            engine_mask: info.engine_mask,
            ..Default::default()
        })?;
        let thread_handle = queue.add_thread_handle()?;
        let shared = Arc::new(LooperShared {
            sender: thread_handle.sender(),
            waker: queue.waker(),
            thread: std::thread::current().id(),
            buses: Mutex::new(Vec::new()),
        });

        let looper = Looper {
            inner: Rc::new(LooperInner {
                queue,
                thread_handle,
                pool: RefCell::new(None),
                pool_name: info.name,
                pool_limit: info.workers_count.max(1),
                shared,
                suspend_threads_on_wakeup: Cell::new(false),
            }),
        };
        TL_LOOPER.with(|slot| *slot.borrow_mut() = Some(looper.clone()));
        Ok(looper)
    }

    /// The current thread's looper, if one was acquired.
    pub fn current() -> Option<Looper> {
        TL_LOOPER.with(|slot| slot.borrow().clone())
    }

    /// Release the current thread's looper now instead of at thread exit.
    /// Handles created on it are cancelled.
    pub fn release() {
        TL_LOOPER.with(|slot| slot.borrow_mut().take());
    }

    /// The `Send + Sync` surface for other threads.
    pub fn handle(&self) -> LooperHandle {
        LooperHandle {
            shared: self.inner.shared.clone(),
        }
    }

    /// The queue driving this looper.
    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// Whether the calling thread owns this looper.
    pub fn is_on_thread(&self) -> bool {
        std::thread::current().id() == self.inner.shared.thread
    }

    /// Schedule a timer on the looper's queue.
    pub fn schedule_timer(
        &self,
        info: TimerInfo,
        completion: impl Fn(&Handle, u32, Status) + 'static,
    ) -> Result<TimerHandle, Status> {
        self.inner.queue.schedule_timer(info, completion)
    }

    /// Schedule a one-shot callback after `timeout`.
    pub fn schedule(
        &self,
        timeout: Duration,
        f: impl Fn(&Handle, bool) + 'static,
    ) -> Result<TimerHandle, Status> {
        self.inner.queue.schedule(timeout, f)
    }

    /// Watch a pollable descriptor on the looper's queue.
    pub fn listen_pollable(
        &self,
        fd: RawFd,
        flags: PollFlags,
        completion: impl Fn(&Handle, u32, Status) + 'static,
    ) -> Result<PollHandle, Status> {
        self.inner.queue.listen_pollable(fd, flags, completion)
    }

    /// Rearm a paused handle.
    pub fn run_handle(&self, handle: &Handle) -> Status {
        self.inner.queue.run_handle(handle)
    }

    /// Run `f` on the looper thread. With `immediate` set and when already
    /// on that thread the call runs inline; otherwise it prefers the
    /// perform-next slot (executed before returning to the kernel) and
    /// falls back to the mailbox.
    pub fn perform_on_thread(&self, f: impl FnOnce() + 'static, immediate: bool) -> Status {
        if immediate && self.is_on_thread() {
            f();
            return Status::Ok;
        }
        if self.inner.queue.is_processing() {
            self.inner.queue.perform_next(f)
        } else {
            self.inner.thread_handle.perform(f)
        }
    }

    /// Hand `f` to the worker pool.
    pub fn perform_async(&self, f: impl FnOnce() + Send + 'static) -> Status {
        self.inner.pool_dispatch(f)
    }

    /// Hand `work` to the worker pool, then run `complete` back on the
    /// looper thread.
    pub fn perform_async_with(
        &self,
        work: impl FnOnce() + Send + 'static,
        complete: impl FnOnce() + Send + 'static,
    ) -> Status {
        let sender = self.inner.shared.sender.clone();
        self.inner.pool_dispatch(move || {
            work();
            sender.perform(complete);
        })
    }

    /// Process ready completions without blocking.
    pub fn poll(&self) -> u32 {
        self.inner.queue.poll()
    }

    /// Block for up to `ival` and process one batch of completions.
    pub fn wait(&self, ival: Option<Duration>) -> u32 {
        self.inner.queue.wait(ival)
    }

    /// Drive the loop; see [`Queue::run`]. Queued mailbox tasks are drained
    /// first, and a `SUSPEND_THREADS` wakeup shuts the worker pool down
    /// after the loop returns.
    pub fn run(&self, ival: Option<Duration>, info: QueueWakeupInfo) -> Status {
        self.inner.thread_handle.drain();

        let status = self.inner.queue.run(ival, info);

        if self.inner.suspend_threads_on_wakeup.replace(false) {
            self.inner.cancel_pool();
        }
        status
    }

    /// Run until woken, with default wakeup behavior.
    pub fn run_default(&self) -> Status {
        self.run(None, QueueWakeupInfo::default())
    }

    /// Stop the innermost `run`.
    pub fn wakeup(&self, flags: WakeupFlags) -> Status {
        if flags.contains(WakeupFlags::SUSPEND_THREADS) {
            self.inner.suspend_threads_on_wakeup.set(true);
        }
        self.inner.queue.wakeup(flags)
    }

    /// Live worker threads of the pool.
    pub fn workers_count(&self) -> usize {
        self.inner
            .pool
            .borrow()
            .as_ref()
            .map(|pool| pool.workers())
            .unwrap_or(0)
    }
}
