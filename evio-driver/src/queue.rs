use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

use bitflags::bitflags;
use evio_log::instrument;

use crate::{
    handle::{CompletionFn, Handle, HandleKind, Source},
    pollable::{self, PollFlags, PollHandle, PollSource},
    sys,
    thread::{self, LocalTask, ThreadHandle},
    timer::{self, TimerHandle, TimerInfo, TimerSource},
    RawFd, Status,
};

bitflags! {
    /// Queue behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueFlags: u32 {
        /// Flush arming requests to the kernel as they are made instead of
        /// batching them until the next `submit_pending`/`poll`/`wait`/`run`.
        const SUBMIT_IMMEDIATE = 1 << 1;
        /// Prefer the thread-native backend. Set by the looper; do not set
        /// on queues created directly.
        const THREAD_NATIVE = 1 << 15;
    }
}

bitflags! {
    /// Completion mechanisms a queue may run on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueEngine: u32 {
        /// Linux io_uring.
        const URING = 1 << 0;
        /// Linux/Android epoll.
        const EPOLL = 1 << 1;
        /// Android ALooper tier; served by the epoll backend.
        const ALOOPER = 1 << 2;
        /// Windows I/O completion ports.
        const IOCP = 1 << 3;
        /// BSD/Darwin kqueue.
        const KQUEUE = 1 << 4;
        /// Darwin CFRunLoop tier; served by the kqueue backend.
        const RUN_LOOP = 1 << 5;
        /// Any engine the platform offers.
        const ANY = Self::URING.bits()
            | Self::EPOLL.bits()
            | Self::ALOOPER.bits()
            | Self::IOCP.bits()
            | Self::KQUEUE.bits()
            | Self::RUN_LOOP.bits();
    }
}

bitflags! {
    /// How a wakeup should stop the running loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WakeupFlags: u32 {
        /// Suspend all armed handles and drain completions before stopping.
        const GRACEFUL = 1 << 0;
        /// The looper should also shut its worker pool down when `run`
        /// returns.
        const SUSPEND_THREADS = 1 << 1;
        /// Use the flags the running context was entered with.
        const CONTEXT_DEFAULT = 1 << 2;
    }
}

/// Parameters for [`Queue::create`].
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    /// Behavior switches.
    pub flags: QueueFlags,
    /// Permitted backends; the first available one in platform preference
    /// order is adopted.
    pub engine_mask: QueueEngine,
    /// Capacity hint for the submission side, where the backend has one.
    pub submit_queue_size: u32,
    /// Capacity hint for the completion side; 0 derives it from
    /// `submit_queue_size`.
    pub complete_queue_size: u32,
}

impl Default for QueueInfo {
    fn default() -> Self {
        Self {
            flags: QueueFlags::default(),
            engine_mask: QueueEngine::ANY,
            submit_queue_size: 32,
            complete_queue_size: 0,
        }
    }
}

/// How [`Queue::run`] should react to wakeups.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueWakeupInfo {
    /// Default wakeup flags of the run context; a wakeup carrying
    /// [`WakeupFlags::CONTEXT_DEFAULT`] resolves to these.
    pub flags: WakeupFlags,
    /// For graceful wakeups, how long to wait for quiescence before forcing
    /// a stop with `ErrorCancelled`.
    pub timeout: Option<Duration>,
}

/// Internal wakeup message, delivered through the backend's wakeup
/// primitive as a structured value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WakeupPacket {
    pub flags: WakeupFlags,
    /// Target the outermost run context instead of the innermost.
    pub root: bool,
}

impl WakeupPacket {
    const ROOT_BIT: u32 = 1 << 30;

    pub(crate) fn encode(self) -> u32 {
        let mut bits = self.flags.bits();
        if self.root {
            bits |= Self::ROOT_BIT;
        }
        bits
    }

    pub(crate) fn decode(bits: u32) -> Self {
        Self {
            flags: WakeupFlags::from_bits_truncate(bits),
            root: bits & Self::ROOT_BIT != 0,
        }
    }
}

/// What a backend observed for one handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NotifyData {
    /// Operation result: tick count for timers, negated errno on failure.
    pub result: i64,
    /// Ready-condition bits for pollables.
    pub flags: u32,
    /// The delivery consumed the kernel registration; the handle should be
    /// rearmed to keep receiving events.
    pub rearm: bool,
}

/// One entry drained from the backend.
pub(crate) enum RawEvent {
    Wakeup(WakeupPacket),
    Event { handle: Handle, data: NotifyData },
}

/// Deferred execution list. Tasks enqueue only while the queue is inside
/// event processing (`enabled > 0`) and run right after the current
/// completion returns, before going back to the kernel.
pub(crate) struct PerformEngine {
    enabled: Cell<u32>,
    tasks: RefCell<VecDeque<LocalTask>>,
}

impl PerformEngine {
    fn new() -> Self {
        Self {
            enabled: Cell::new(0),
            tasks: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn perform(&self, task: LocalTask) -> Status {
        if self.enabled.get() == 0 {
            return Status::Declined;
        }
        self.tasks.borrow_mut().push_back(task);
        Status::Ok
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.get() > 0
    }

    fn enable(&self) {
        self.enabled.set(self.enabled.get() + 1);
    }

    fn disable(&self) {
        self.enabled.set(self.enabled.get() - 1);
    }

    fn run_all(&self) -> u32 {
        let mut nevents = 0;
        // Re-borrow on every iteration: a task may enqueue more tasks.
        loop {
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    nevents += 1;
                }
                None => break,
            }
        }
        nevents
    }

    fn cleanup(&self) {
        self.tasks.borrow_mut().clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    Poll,
    Wait,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtxState {
    Running,
    /// The next loop turn should stop this context.
    Signaled,
    /// Waiting for all handles to become suspended, or for the wakeup
    /// timeout to expire.
    Stopping,
    Stopped,
}

/// One entry of the nested `poll`/`wait`/`run` stack.
pub(crate) struct RunContext {
    #[allow(dead_code)]
    pub mode: RunMode,
    pub state: Cell<CtxState>,
    pub run_wakeup_flags: WakeupFlags,
    pub wakeup_status: Cell<Status>,
    pub wakeup_timeout: Option<Duration>,
    pub stop_deadline: Cell<Option<Instant>>,
}

impl RunContext {
    fn new(mode: RunMode, flags: WakeupFlags, timeout: Option<Duration>) -> Rc<Self> {
        Rc::new(Self {
            mode,
            state: Cell::new(CtxState::Running),
            run_wakeup_flags: flags,
            wakeup_status: Cell::new(Status::Suspended),
            wakeup_timeout: timeout,
            stop_deadline: Cell::new(None),
        })
    }
}

pub(crate) struct QueueInner {
    flags: QueueFlags,
    engine: QueueEngine,
    driver: RefCell<sys::Driver>,
    pub(crate) perform: PerformEngine,

    /// Accepting new arming requests; cleared while quiesced.
    running: Cell<bool>,
    /// Resumable handles currently known to the queue (armed or suspended).
    suspendable: RefCell<Vec<Handle>>,
    /// Handles whose arming was requested while the queue was quiesced.
    pending: RefCell<Vec<Handle>>,
    /// Handles waiting for a predecessor to complete, keyed by the
    /// predecessor.
    successors: RefCell<HashMap<usize, Vec<Handle>>>,

    running_handles: Cell<u32>,
    suspended_handles: Cell<u32>,
    registered_handles: Cell<u32>,

    contexts: RefCell<Vec<Rc<RunContext>>>,
}

impl QueueInner {
    // ---- handle state machine ----

    /// Arm a handle with the backend, or park it until the queue resumes.
    pub(crate) fn run_handle(self: &Rc<Self>, handle: &Handle) -> Status {
        if handle.status() == Status::Declined {
            // Paused after an earlier arm; rearming is a resume.
            return self.resume_handle(handle);
        }
        if !self.running.get() {
            self.pending.borrow_mut().push(handle.clone());
            return Status::Suspended;
        }
        let status = self.arm_handle(handle);
        if status.is_error() {
            evio_log::error!("failed to run handle: {status}");
            // Kernel refusal: terminal error, completion fires once.
            handle.cell.status.set(status);
            handle.finalize(0, status);
            self.registered_handles
                .set(self.registered_handles.get().saturating_sub(1));
        }
        status
    }

    fn arm_handle(self: &Rc<Self>, handle: &Handle) -> Status {
        let status = self.driver.borrow_mut().arm(handle);
        if status.is_error() {
            return status;
        }
        handle.cell.status.set(Status::Ok);
        self.running_handles.set(self.running_handles.get() + 1);
        if handle.is_resumable() {
            self.suspendable.borrow_mut().push(handle.clone());
        }
        self.submit_if_immediate();
        Status::Ok
    }

    /// Re-register a handle whose kernel slot was consumed by a delivery.
    /// Counters are untouched: this stays within the same arming epoch.
    pub(crate) fn rearm_handle(self: &Rc<Self>, handle: &Handle) {
        let status = self.driver.borrow_mut().arm(handle);
        if status.is_error() {
            handle.cancel_with(status, 0);
            return;
        }
        self.submit_if_immediate();
    }

    pub(crate) fn suspend_handle(self: &Rc<Self>, handle: &Handle) -> Status {
        let status = self.driver.borrow_mut().disarm(handle);
        if status != Status::Ok {
            evio_log::error!("failed to suspend handle: {status}");
            return status;
        }
        handle.bump_timeline();
        handle.cell.status.set(Status::Suspended);
        self.suspended_handles.set(self.suspended_handles.get() + 1);
        if self.suspended_handles.get() == self.running_handles.get() {
            self.notify_suspended_all();
        }
        Status::Ok
    }

    pub(crate) fn resume_handle(self: &Rc<Self>, handle: &Handle) -> Status {
        if !self
            .suspendable
            .borrow()
            .iter()
            .any(|h| h.same_handle(handle))
        {
            // Never started.
            return Status::ErrorNoSuchProcess;
        }
        let status = self.driver.borrow_mut().arm(handle);
        if status.is_error() {
            evio_log::error!("failed to resume handle: {status}");
            return status;
        }
        self.suspended_handles
            .set(self.suspended_handles.get().saturating_sub(1));
        handle.cell.status.set(Status::Ok);
        self.submit_if_immediate();
        Status::Ok
    }

    pub(crate) fn cancel_handle(self: &Rc<Self>, handle: &Handle, st: Status, value: u32) -> Status {
        let current = handle.status();
        if current.is_valid_cancel() || current == Status::Pending {
            return Status::ErrorAlreadyPerformed;
        }

        // Stop the kernel from referencing the handle first.
        if current == Status::Ok && self.suspend_handle(handle) != Status::Ok {
            return Status::ErrorNotPermitted;
        }

        match handle.status() {
            Status::Suspended | Status::Declined => {
                handle.cell.status.set(st);
                handle.finalize(value, st);

                self.suspended_handles
                    .set(self.suspended_handles.get().saturating_sub(1));
                self.running_handles
                    .set(self.running_handles.get().saturating_sub(1));
                self.registered_handles
                    .set(self.registered_handles.get().saturating_sub(1));
                self.suspendable
                    .borrow_mut()
                    .retain(|h| !h.same_handle(handle));

                self.release_poll_fd(handle);
                self.run_successors(handle, st);

                if self.suspended_handles.get() == self.running_handles.get() {
                    self.notify_suspended_all();
                }
                Status::Ok
            }
            _ => Status::ErrorAlreadyPerformed,
        }
    }

    fn release_poll_fd(&self, handle: &Handle) {
        if handle.kind() != HandleKind::Poll {
            return;
        }
        let mut source = handle.cell.source.borrow_mut();
        let poll = source.as_poll();
        if poll.flags.contains(PollFlags::CLOSE_FD) {
            sys::close_raw_fd(poll.fd);
            poll.flags.remove(PollFlags::CLOSE_FD);
        }
    }

    fn run_successors(self: &Rc<Self>, handle: &Handle, st: Status) {
        let successors = self.successors.borrow_mut().remove(&handle.key());
        let Some(successors) = successors else {
            return;
        };
        for succ in successors {
            if st == Status::Done {
                self.run_handle(&succ);
            } else {
                succ.cancel();
            }
        }
    }

    pub(crate) fn reset_timer(
        self: &Rc<Self>,
        handle: &Handle,
        info: &TimerInfo,
        completion: Option<CompletionFn>,
    ) -> Status {
        if handle.status().is_valid_cancel() {
            return Status::ErrorAlreadyPerformed;
        }
        if !self.driver.borrow().supports_timer_reset(handle, info.count) {
            evio_log::error!(
                "timer repeat count {} cannot be expressed by the active backend; reset refused",
                info.count
            );
            return Status::ErrorNotSupported;
        }
        if let Some(completion) = completion {
            handle.replace_completion(completion);
        }
        if handle.status() == Status::Ok {
            let status = self.suspend_handle(handle);
            if status != Status::Ok {
                return status;
            }
        }
        handle.cell.source.borrow_mut().as_timer().reset(info);
        match handle.status() {
            Status::Suspended | Status::Declined => self.resume_handle(handle),
            _ => Status::Ok,
        }
    }

    // ---- quiesce / resume ----

    /// Suspend every resumable handle; returns how many armed handles are
    /// left running afterwards.
    fn suspend_all(self: &Rc<Self>) -> u32 {
        self.running.set(false);
        let handles = self.suspendable.borrow().clone();
        for handle in &handles {
            match handle.status() {
                Status::Ok => {
                    let st = self.suspend_handle(handle);
                    if !st.is_successful() {
                        evio_log::error!("suspend_all: failed to suspend a handle: {st}");
                    }
                }
                Status::Suspended | Status::Declined => {}
                st => {
                    evio_log::error!("suspend_all: invalid status for a resumable handle: {st}");
                }
            }
        }
        self.running_handles
            .get()
            .saturating_sub(self.suspended_handles.get())
    }

    pub(crate) fn resume_all(self: &Rc<Self>) -> u32 {
        if self.running.get() {
            return 0;
        }
        self.running.set(true);

        let mut nhandles = 0;
        let handles = self.suspendable.borrow().clone();
        for handle in &handles {
            match handle.status() {
                Status::Suspended => {
                    if self.resume_handle(handle) == Status::Ok {
                        nhandles += 1;
                    }
                }
                Status::Declined => {}
                st => {
                    evio_log::error!("resume_all: invalid status for a resumable handle: {st}");
                }
            }
        }

        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for handle in pending {
            if self.run_handle(&handle).is_successful() {
                nhandles += 1;
            }
        }
        nhandles
    }

    // ---- run context stack ----

    fn push_context(&self, ctx: &Rc<RunContext>) {
        self.contexts.borrow_mut().push(ctx.clone());
    }

    fn pop_context(self: &Rc<Self>, ctx: &Rc<RunContext>) {
        {
            let mut contexts = self.contexts.borrow_mut();
            debug_assert!(contexts
                .last()
                .is_some_and(|top| Rc::ptr_eq(top, ctx)));
            contexts.pop();
        }
        let top = self.contexts.borrow().last().cloned();
        if let Some(top) = top {
            if top.state.get() == CtxState::Signaled {
                self.stop_context(Some(&top), top.run_wakeup_flags, false);
            }
        }
    }

    /// Request a stop of `target` (or the innermost context). Marks every
    /// context from the top of the stack down to the target, then stops the
    /// top one: gracefully (quiesce first) or forced, per `flags`.
    pub(crate) fn stop_context(
        self: &Rc<Self>,
        target: Option<&Rc<RunContext>>,
        flags: WakeupFlags,
        external: bool,
    ) -> Status {
        let top = self.contexts.borrow().last().cloned();
        let Some(top) = top else {
            return Status::ErrorInvalidArgument;
        };

        let mut status = Status::Ok;
        if let Some(target) = target {
            if !Rc::ptr_eq(target, &top) {
                let stack = self.contexts.borrow().clone();
                if !stack.iter().any(|ctx| Rc::ptr_eq(ctx, target)) {
                    return Status::ErrorNotFound;
                }
                for ctx in stack.iter().rev() {
                    if ctx.state.get() == CtxState::Running {
                        ctx.state.set(CtxState::Signaled);
                    }
                    if Rc::ptr_eq(ctx, target) {
                        break;
                    }
                }
            } else if top.state.get() == CtxState::Running {
                top.state.set(CtxState::Signaled);
            }
        } else if top.state.get() == CtxState::Running {
            top.state.set(CtxState::Signaled);
        }

        if top.state.get() == CtxState::Signaled {
            let flags = if flags.contains(WakeupFlags::CONTEXT_DEFAULT) {
                top.run_wakeup_flags
            } else {
                flags
            };

            let mut next = CtxState::Stopped;
            if flags.contains(WakeupFlags::GRACEFUL) {
                let remaining = self.suspend_all();
                if remaining == 0 {
                    top.wakeup_status.set(Status::Ok);
                } else {
                    next = CtxState::Stopping;
                    top.stop_deadline
                        .set(top.wakeup_timeout.map(|t| Instant::now() + t));
                }
                status = Status::Suspended;
            } else {
                top.wakeup_status.set(if external {
                    Status::Suspended
                } else {
                    Status::Done
                });
                status = Status::Ok;
            }
            top.state.set(next);
        }

        status
    }

    pub(crate) fn stop_root_context(self: &Rc<Self>, flags: WakeupFlags, external: bool) -> Status {
        let root = self.contexts.borrow().first().cloned();
        match root {
            Some(root) => self.stop_context(Some(&root), flags, external),
            None => Status::ErrorInvalidArgument,
        }
    }

    /// Every armed handle is now suspended; a gracefully stopping context
    /// may finish.
    fn notify_suspended_all(&self) {
        if let Some(top) = self.contexts.borrow().last() {
            if top.state.get() == CtxState::Stopping {
                top.wakeup_status.set(Status::Ok);
                top.state.set(CtxState::Stopped);
            }
        }
    }

    fn handle_wakeup_packet(self: &Rc<Self>, packet: WakeupPacket) {
        if self.contexts.borrow().is_empty() {
            return;
        }
        if packet.root {
            self.stop_root_context(packet.flags, true);
        } else {
            self.stop_context(None, packet.flags, true);
        }
    }

    // ---- event processing ----

    /// One trip to the kernel: wait up to `timeout`, then dispatch
    /// everything that arrived. Returns the dispatch count.
    fn wait_events(self: &Rc<Self>, timeout: Option<Duration>) -> (Status, u32) {
        let mut events: Vec<RawEvent> = Vec::new();
        let status = self.driver.borrow_mut().wait(timeout, &mut events);
        if status.is_error() {
            return (status, 0);
        }
        let mut nevents = 0;
        for event in events {
            nevents += 1;
            match event {
                RawEvent::Wakeup(packet) => self.handle_wakeup_packet(packet),
                RawEvent::Event { handle, data } => self.notify(&handle, data),
            }
        }
        (Status::Ok, nevents)
    }

    pub(crate) fn notify(self: &Rc<Self>, handle: &Handle, data: NotifyData) {
        self.perform.enable();
        match handle.kind() {
            HandleKind::Timer => timer::notify(self, handle, data),
            HandleKind::Poll => pollable::notify(self, handle, data),
            HandleKind::Thread => thread::notify(self, handle, data),
        }
        self.perform.run_all();
        self.perform.disable();
    }

    fn submit_if_immediate(&self) {
        if self.flags.contains(QueueFlags::SUBMIT_IMMEDIATE) {
            let status = self.driver.borrow_mut().submit();
            if status.is_error() {
                evio_log::error!("submit failed: {status}");
            }
        }
    }

    fn submit(&self) -> Status {
        self.driver.borrow_mut().submit()
    }

    // ---- public entry points (via Queue) ----

    fn poll(self: &Rc<Self>) -> u32 {
        self.resume_all();
        self.submit();
        let ctx = RunContext::new(RunMode::Poll, WakeupFlags::default(), None);
        self.push_context(&ctx);
        let (_, nevents) = self.wait_events(Some(Duration::ZERO));
        self.pop_context(&ctx);
        nevents
    }

    fn wait(self: &Rc<Self>, ival: Option<Duration>) -> u32 {
        self.resume_all();
        self.submit();
        let ctx = RunContext::new(RunMode::Wait, WakeupFlags::default(), None);
        self.push_context(&ctx);
        let (_, nevents) = self.wait_events(ival);
        self.pop_context(&ctx);
        nevents
    }

    fn run(self: &Rc<Self>, ival: Option<Duration>, info: QueueWakeupInfo) -> Status {
        instrument!(evio_log::Level::DEBUG, "run", ?ival);
        self.resume_all();
        self.submit();

        let ctx = RunContext::new(RunMode::Run, info.flags, info.timeout);
        self.push_context(&ctx);

        // The run timeout is an ordinary timer on this very queue.
        let timeout_timer = ival.and_then(|d| {
            let queue = Rc::downgrade(self);
            let ctx = ctx.clone();
            let flags = info.flags;
            self.schedule_timer_inner(&TimerInfo::once(d), move |_h, _value, status| {
                if status == Status::Done {
                    if let Some(queue) = queue.upgrade() {
                        queue.stop_context(Some(&ctx), flags, false);
                    }
                }
            })
            .ok()
        });

        loop {
            match ctx.state.get() {
                CtxState::Stopped => break,
                CtxState::Stopping => {
                    let deadline = ctx.stop_deadline.get();
                    let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                    if timeout.is_some_and(|t| t.is_zero()) {
                        // Quiescence was not reached in time.
                        ctx.wakeup_status.set(Status::ErrorCancelled);
                        ctx.state.set(CtxState::Stopped);
                        break;
                    }
                    let (status, _) = self.wait_events(timeout);
                    if status.is_error() && status != Status::ErrorInterrupted {
                        evio_log::error!("queue backend error: {status}");
                        ctx.wakeup_status.set(status);
                        break;
                    }
                }
                _ => {
                    let (status, _) = self.wait_events(None);
                    if status.is_error() && status != Status::ErrorInterrupted {
                        evio_log::error!("queue backend error: {status}");
                        ctx.wakeup_status.set(status);
                        break;
                    }
                }
            }
        }

        if let Some(timer) = timeout_timer {
            timer.cancel();
        }

        self.pop_context(&ctx);
        ctx.wakeup_status.get()
    }

    fn wakeup(self: &Rc<Self>, flags: WakeupFlags) -> Status {
        self.driver.borrow().waker().wakeup(WakeupPacket {
            flags,
            root: false,
        })
    }

    // ---- handle construction ----

    fn schedule_timer_inner(
        self: &Rc<Self>,
        info: &TimerInfo,
        completion: impl Fn(&Handle, u32, Status) + 'static,
    ) -> Result<TimerHandle, Status> {
        let status = info.validate();
        if status != Status::Ok {
            return Err(status);
        }
        let handle = Handle::new(
            self,
            HandleKind::Timer,
            Source::Timer(TimerSource::new(info)),
            Some(Rc::new(completion)),
        );
        self.registered_handles.set(self.registered_handles.get() + 1);
        let status = self.run_handle(&handle);
        if status.is_error() {
            return Err(status);
        }
        Ok(TimerHandle { handle })
    }

    fn listen_pollable_inner(
        self: &Rc<Self>,
        fd: RawFd,
        flags: PollFlags,
        completion: impl Fn(&Handle, u32, Status) + 'static,
    ) -> Result<PollHandle, Status> {
        let handle = Handle::new(
            self,
            HandleKind::Poll,
            Source::Poll(PollSource {
                fd,
                flags,
                #[cfg(windows)]
                wait: std::ptr::null_mut(),
            }),
            Some(Rc::new(completion)),
        );
        self.registered_handles.set(self.registered_handles.get() + 1);
        let status = self.run_handle(&handle);
        if status.is_error() {
            return Err(status);
        }
        Ok(PollHandle { handle })
    }

    fn add_thread_handle_inner(self: &Rc<Self>) -> Result<ThreadHandle, Status> {
        let source = self.driver.borrow_mut().create_thread_source()?;
        let handle = Handle::new(self, HandleKind::Thread, Source::Thread(source), None);
        self.registered_handles.set(self.registered_handles.get() + 1);
        let status = self.run_handle(&handle);
        if status.is_error() {
            return Err(status);
        }
        Ok(ThreadHandle { handle })
    }

    fn cancel_all(self: &Rc<Self>) {
        let mut handles = self.suspendable.borrow().clone();
        handles.extend(self.pending.borrow().iter().cloned());
        for handle in handles {
            handle.cancel();
        }
        self.suspendable.borrow_mut().clear();
        self.pending.borrow_mut().clear();
        self.running.set(false);
        self.perform.cleanup();
    }
}

/// A single-threaded event loop over one OS completion backend.
///
/// All methods must be called on the thread the queue was created on; the
/// cross-thread surfaces are [`QueueWaker`] and [`ThreadSender`].
///
/// [`ThreadSender`]: crate::ThreadSender
#[derive(Clone)]
pub struct Queue {
    inner: Rc<QueueInner>,
}

impl Queue {
    /// Create a queue on the first backend of `info.engine_mask` that
    /// initializes, in platform preference order.
    pub fn create(info: QueueInfo) -> Result<Queue, Status> {
        let (driver, engine) = sys::Driver::create(&info)?;
        Ok(Queue {
            inner: Rc::new(QueueInner {
                flags: info.flags,
                engine,
                driver: RefCell::new(driver),
                perform: PerformEngine::new(),
                running: Cell::new(true),
                suspendable: RefCell::new(Vec::new()),
                pending: RefCell::new(Vec::new()),
                successors: RefCell::new(HashMap::new()),
                running_handles: Cell::new(0),
                suspended_handles: Cell::new(0),
                registered_handles: Cell::new(0),
                contexts: RefCell::new(Vec::new()),
            }),
        })
    }

    /// Schedule a timer and arm it.
    pub fn schedule_timer(
        &self,
        info: TimerInfo,
        completion: impl Fn(&Handle, u32, Status) + 'static,
    ) -> Result<TimerHandle, Status> {
        self.inner.schedule_timer_inner(&info, completion)
    }

    /// Schedule a one-shot callback after `timeout`. The callback receives
    /// `true` when the timer fired and `false` when it failed or was
    /// cancelled.
    pub fn schedule(
        &self,
        timeout: Duration,
        f: impl Fn(&Handle, bool) + 'static,
    ) -> Result<TimerHandle, Status> {
        self.inner
            .schedule_timer_inner(&TimerInfo::once(timeout), move |handle, _value, status| {
                if status == Status::Done {
                    f(handle, true);
                } else if status.is_error() {
                    f(handle, false);
                }
            })
    }

    /// Watch a pollable descriptor for the given readiness conditions and
    /// arm the watch.
    pub fn listen_pollable(
        &self,
        fd: RawFd,
        flags: PollFlags,
        completion: impl Fn(&Handle, u32, Status) + 'static,
    ) -> Result<PollHandle, Status> {
        self.inner.listen_pollable_inner(fd, flags, completion)
    }

    /// Create and arm a cross-thread wakeup handle.
    pub fn add_thread_handle(&self) -> Result<ThreadHandle, Status> {
        self.inner.add_thread_handle_inner()
    }

    /// Rearm a handle the user paused earlier. Equivalent to
    /// [`Handle::resume`], gated on the `Declined` state.
    pub fn run_handle(&self, handle: &Handle) -> Status {
        if handle.status() != Status::Declined {
            return Status::ErrorAlreadyPerformed;
        }
        self.inner.resume_handle(handle)
    }

    /// Park `handle` until `origin` completes: run it when `origin` ends
    /// with `Done`, cancel it when `origin` fails.
    pub fn run_handle_after(&self, handle: &Handle, origin: &Handle) -> Status {
        match origin.status() {
            Status::Done => self.inner.run_handle(handle),
            st if st.is_successful() => {
                self.inner
                    .successors
                    .borrow_mut()
                    .entry(origin.key())
                    .or_default()
                    .push(handle.clone());
                Status::Suspended
            }
            _ => Status::ErrorInvalidArgument,
        }
    }

    /// Resume quiesced handles and flush gathered arming requests.
    pub fn submit_pending(&self) -> Status {
        self.inner.resume_all();
        self.inner.submit()
    }

    /// Process already-ready completions without blocking. Returns the
    /// number of dispatches.
    pub fn poll(&self) -> u32 {
        self.inner.poll()
    }

    /// Block for up to `ival` (or indefinitely when `None`), process one
    /// batch of completions and return the number of dispatches.
    pub fn wait(&self, ival: Option<Duration>) -> u32 {
        self.inner.wait(ival)
    }

    /// Drive the loop until `ival` elapses (`Done`), a graceful wakeup
    /// completes (`Ok`), a forced wakeup arrives (`Suspended`) or a
    /// graceful wakeup times out (`ErrorCancelled`).
    pub fn run(&self, ival: Option<Duration>, info: QueueWakeupInfo) -> Status {
        self.inner.run(ival, info)
    }

    /// Stop the innermost `run` with the given flags.
    pub fn wakeup(&self, flags: WakeupFlags) -> Status {
        self.inner.wakeup(flags)
    }

    /// A `Send + Sync` wakeup endpoint for other threads.
    pub fn waker(&self) -> QueueWaker {
        QueueWaker {
            inner: self.inner.driver.borrow().waker(),
        }
    }

    /// Schedule a task for execution right after the current completion
    /// callback returns. Only valid from within event processing; returns
    /// `Declined` otherwise.
    pub fn perform_next(&self, f: impl FnOnce() + 'static) -> Status {
        self.inner.perform.perform(Box::new(f))
    }

    /// Whether the calling code runs inside event processing, where
    /// [`perform_next`](Queue::perform_next) is accepted.
    pub fn is_processing(&self) -> bool {
        self.inner.perform.is_enabled()
    }

    /// Cancel every handle and reject further arming requests.
    pub fn cancel(&self) {
        self.inner.cancel_all();
    }

    /// The behavior switches the queue was created with.
    pub fn flags(&self) -> QueueFlags {
        self.inner.flags
    }

    /// The backend the queue actually runs on.
    pub fn engine(&self) -> QueueEngine {
        self.inner.engine
    }

    /// Number of handles currently armed with the backend.
    pub fn running_handles(&self) -> u32 {
        self.inner.running_handles.get()
    }

    /// Number of handles created and not yet terminal.
    pub fn registered_handles(&self) -> u32 {
        self.inner.registered_handles.get()
    }
}

/// A `Send + Sync` endpoint that wakes a [`Queue`] from another thread.
#[derive(Clone)]
pub struct QueueWaker {
    inner: sys::Waker,
}

impl QueueWaker {
    /// Stop the queue's innermost `run` with the given flags.
    pub fn wakeup(&self, flags: WakeupFlags) -> Status {
        self.inner.wakeup(WakeupPacket { flags, root: false })
    }

    /// Stop the queue's outermost `run`, unwinding nested contexts.
    pub fn wakeup_root(&self, flags: WakeupFlags) -> Status {
        self.inner.wakeup(WakeupPacket { flags, root: true })
    }
}
