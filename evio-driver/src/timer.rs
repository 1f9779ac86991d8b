use std::{ops::Deref, rc::Rc, time::Duration};

use crate::{
    handle::Handle,
    queue::{NotifyData, QueueInner},
    Status,
};

/// The clock a timer counts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum ClockType {
    /// Backend default, currently the same as [`Monotonic`](Self::Monotonic).
    #[default]
    Default,
    /// Monotonic clock, unaffected by wall-clock adjustments.
    Monotonic,
    /// Wall clock.
    Realtime,
    /// Per-process CPU clock. Not supported by the current backends.
    Process,
    /// Per-thread CPU clock. Not supported by the current backends.
    Thread,
    /// Raw hardware clock. Not supported by the current backends.
    Hardware,
}

/// Parameters of a timer handle.
///
/// The first firing occurs after `timeout`, subsequent firings every
/// `interval`, `count` times in total ([`TimerInfo::INFINITE`] to never
/// stop). Either `timeout` or `interval` must be non-zero and `count` at
/// least 1, or scheduling fails with `ErrorInvalidArgument`.
#[derive(Debug, Clone, Copy)]
pub struct TimerInfo {
    /// Delay before the first firing; falls back to `interval` when zero.
    pub timeout: Duration,
    /// Delay between subsequent firings.
    pub interval: Duration,
    /// Total number of firings.
    pub count: u32,
    /// The clock to count on.
    pub clock: ClockType,
}

impl Default for TimerInfo {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            interval: Duration::ZERO,
            count: 1,
            clock: ClockType::Default,
        }
    }
}

impl TimerInfo {
    /// `count` value for a timer that fires until cancelled.
    pub const INFINITE: u32 = u32::MAX;

    /// A timer firing once after `timeout`.
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// A timer firing every `interval`, `count` times.
    pub fn repeating(interval: Duration, count: u32) -> Self {
        Self {
            timeout: interval,
            interval,
            count,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Status {
        if self.count == 0 || (self.timeout.is_zero() && self.interval.is_zero()) {
            evio_log::error!("invalid parameters for timer");
            return Status::ErrorInvalidArgument;
        }
        match self.clock {
            ClockType::Default | ClockType::Monotonic | ClockType::Realtime => Status::Ok,
            clock => {
                evio_log::error!("{clock:?} is not supported for a timer on this system");
                Status::ErrorNotImplemented
            }
        }
    }
}

/// Per-arming state of a timer handle.
pub(crate) struct TimerSource {
    pub timeout: Duration,
    pub interval: Duration,
    pub count: u32,
    pub clock: ClockType,
    /// Fired ticks, saturated at `count`.
    pub value: u32,
    /// The separate first shot is still pending.
    pub leading: bool,
    /// Backing timer descriptor, when the backend uses one.
    #[cfg(any(epoll_like, io_uring))]
    pub fd: Option<std::os::fd::OwnedFd>,
    /// The descriptor carries the current schedule; cleared by `reset`.
    #[cfg(any(epoll_like, io_uring))]
    pub programmed: bool,
    /// Landing pad for in-flight kernel reads of the descriptor.
    #[cfg(io_uring)]
    pub read_buf: u64,
    /// Stable storage for the timespec a ring timeout op points at.
    #[cfg(io_uring)]
    pub timespec: io_uring::types::Timespec,
    /// Waitable timer object.
    #[cfg(windows)]
    pub timer: std::os::windows::io::RawHandle,
    /// Registered wait associating the timer with the port.
    #[cfg(windows)]
    pub wait: std::os::windows::io::RawHandle,
}

impl TimerSource {
    pub(crate) fn new(info: &TimerInfo) -> Self {
        let mut info = *info;
        if info.count == 1 {
            info.interval = info.timeout;
        }
        if info.timeout.is_zero() {
            info.timeout = info.interval;
        }
        if info.count > 1 && info.interval.is_zero() {
            info.interval = info.timeout;
        }
        Self {
            timeout: info.timeout,
            interval: info.interval,
            count: info.count,
            clock: info.clock,
            value: 0,
            leading: info.timeout != info.interval,
            #[cfg(any(epoll_like, io_uring))]
            fd: None,
            #[cfg(any(epoll_like, io_uring))]
            programmed: false,
            #[cfg(io_uring)]
            read_buf: 0,
            #[cfg(io_uring)]
            timespec: io_uring::types::Timespec::new(),
            #[cfg(windows)]
            timer: std::ptr::null_mut(),
            #[cfg(windows)]
            wait: std::ptr::null_mut(),
        }
    }

    pub(crate) fn reset(&mut self, info: &TimerInfo) {
        #[cfg(any(epoll_like, io_uring))]
        let fd = self.fd.take();
        #[cfg(windows)]
        let (timer, wait) = (self.timer, self.wait);
        *self = Self::new(info);
        #[cfg(any(epoll_like, io_uring))]
        {
            // Keep the descriptor: the backend reprograms it on rearm.
            self.fd = fd;
        }
        #[cfg(windows)]
        {
            self.timer = timer;
            self.wait = wait;
        }
    }
}

/// A timer created with [`Queue::schedule_timer`].
///
/// Dereferences to [`Handle`]; the completion receives the cumulative fire
/// counter as its value and `Done` with `value == count` on the final fire.
///
/// [`Queue::schedule_timer`]: crate::Queue::schedule_timer
#[derive(Clone, Debug)]
pub struct TimerHandle {
    pub(crate) handle: Handle,
}

impl Deref for TimerHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl TimerHandle {
    /// Rearm the timer with new parameters, optionally replacing the
    /// completion atomically.
    ///
    /// Refused with `ErrorNotSupported` when the active backend cannot
    /// express the requested repeat count without re-creating the handle,
    /// and with `ErrorAlreadyPerformed` once the timer is terminal.
    pub fn reset(
        &self,
        info: TimerInfo,
        completion: Option<impl Fn(&Handle, u32, Status) + 'static>,
    ) -> Status {
        let st = info.validate();
        if st != Status::Ok {
            return st;
        }
        let Some(queue) = self.handle.cell.queue.upgrade() else {
            return Status::ErrorNoSuchProcess;
        };
        queue.reset_timer(
            &self.handle,
            &info,
            completion.map(|f| Rc::new(f) as crate::handle::CompletionFn),
        )
    }
}

/// Timer event dispatch: account ticks, fire the completion, saturate at
/// `count`, rearm when the backend consumed its registration.
pub(crate) fn notify(queue: &Rc<QueueInner>, handle: &Handle, data: NotifyData) {
    if handle.status() != Status::Ok {
        return;
    }

    if data.result < 0 {
        handle.cancel_with(Status::from_os_error(-data.result as i32), 0);
        return;
    }

    let (value, count) = {
        let mut source = handle.cell.source.borrow_mut();
        let timer = source.as_timer();
        timer.leading = false;
        let ticks = u32::try_from(data.result).unwrap_or(u32::MAX).max(1);
        if timer.count == TimerInfo::INFINITE {
            timer.value = timer.value.wrapping_add(ticks);
        } else {
            timer.value = timer.value.saturating_add(ticks).min(timer.count);
        }
        (timer.value, timer.count)
    };

    handle.send_completion(value, Status::Ok);

    // The completion may have cancelled or paused the handle.
    if handle.status() != Status::Ok {
        return;
    }

    if count != TimerInfo::INFINITE && value >= count {
        handle.cancel_with(Status::Done, count);
    } else if data.rearm {
        queue.rearm_handle(handle);
    }
}
