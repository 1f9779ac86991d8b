//! io_uring backend: multishot timeouts and polls, async cancel keyed on
//! the registration cookie, eventfd wakeups and a futex fast path for
//! thread handles.

use std::{
    collections::VecDeque,
    os::fd::{AsRawFd, OwnedFd},
    sync::{Arc, Mutex},
    time::Duration,
};

use io_uring::{
    cqueue, opcode, squeue,
    types::{Fd, SubmitArgs, Timespec, TimeoutFlags},
    IoUring, Probe,
};
use rustix::event::{eventfd, EventfdFlags};
use slab::Slab;

use crate::{
    handle::{Handle, HandleKind, Source},
    queue::{NotifyData, QueueInfo, RawEvent},
    sys::{
        drain_packets, pack_cookie, prepare_timer_fd, serial_of, unpack_cookie, PacketQueue,
        ThreadSignal, Waker,
    },
    thread::{Mailbox, ThreadSource},
    timer::TimerInfo,
    Status,
};

pub(crate) mod futex;

// Reserved user_data values for driver-internal completions.
const CANCEL: u64 = u64::MAX;
const NOTIFY: u64 = u64::MAX - 1;
const IGNORED: u64 = u64::MAX - 2;
/// Marks the fail-safe timeout of a futex thread handle.
const FAILSAFE_BIT: u64 = 1 << 48;

const FUTEX2_SIZE_U32: u32 = 0x2;
const FUTEX2_PRIVATE: u32 = 128;

/// The fail-safe rearm period of the futex thread-handle path: a missed
/// futex wake is recovered within this interval.
const FAILSAFE_INTERVAL: Duration = Duration::from_millis(50);

struct Registration {
    handle: Handle,
    serial: u32,
    /// The kernel registration survives deliveries (multishot op).
    multishot: bool,
    /// A `FUTEX_WAIT` op is in flight for this thread handle.
    futex_armed: bool,
    /// The fail-safe timeout is in flight for this thread handle.
    failsafe_armed: bool,
}

pub(crate) struct IourDriver {
    ring: IoUring,
    squeue: VecDeque<squeue::Entry>,
    registered: Slab<Registration>,
    packets: Arc<PacketQueue>,
    notify_fd: Arc<OwnedFd>,
    notify_buf: Box<u64>,
    notify_registered: bool,
    futex_supported: bool,
    multishot_timeout: bool,
    /// Stable storage for the fail-safe period sqe pointer.
    failsafe_ts: Timespec,
}

impl IourDriver {
    pub(crate) fn create(info: &QueueInfo) -> Result<Self, Status> {
        let capacity = info.submit_queue_size.max(2);
        let ring = IoUring::builder()
            .build(capacity)
            .map_err(Status::from)?;

        let mut probe = Probe::new();
        let futex_supported = ring
            .submitter()
            .register_probe(&mut probe)
            .map(|()| probe.is_supported(opcode::FutexWait::CODE))
            .unwrap_or(false);

        let notify_fd =
            Arc::new(eventfd(0, EventfdFlags::CLOEXEC).map_err(Status::from)?);

        Ok(Self {
            ring,
            squeue: VecDeque::with_capacity(capacity as usize),
            registered: Slab::new(),
            packets: Arc::new(PacketQueue::new()),
            notify_fd,
            notify_buf: Box::new(0),
            notify_registered: false,
            futex_supported,
            multishot_timeout: kernel_at_least(6, 4),
            failsafe_ts: timespec(FAILSAFE_INTERVAL),
        })
    }

    fn push(&mut self, entry: squeue::Entry) {
        self.squeue.push_back(entry);
    }

    /// Move gathered entries into the ring. Returns `true` once the
    /// user-space queue is empty.
    fn flush_submissions(&mut self) -> bool {
        let mut sq = self.ring.submission();
        while !sq.is_full() {
            match self.squeue.pop_front() {
                Some(entry) => unsafe {
                    sq.push(&entry).expect("queue has enough space");
                },
                None => break,
            }
        }
        sq.sync();
        self.squeue.is_empty()
    }

    pub(crate) fn arm(&mut self, handle: &Handle) -> Status {
        let (token, serial) = match handle.cell.token.get() {
            Some(token) => match self.registered.get(token) {
                Some(registration) => (token, registration.serial),
                None => return Status::ErrorUnknown,
            },
            None => {
                let serial = serial_of(handle);
                let token = self.registered.insert(Registration {
                    handle: handle.clone(),
                    serial,
                    multishot: false,
                    futex_armed: false,
                    failsafe_armed: false,
                });
                handle.cell.token.set(Some(token));
                (token, serial)
            }
        };
        let cookie = pack_cookie(token, serial);

        if self
            .registered
            .get(token)
            .is_some_and(|registration| registration.multishot)
        {
            // The kernel registration is still live.
            return Status::Ok;
        }

        let mut source = handle.cell.source.borrow_mut();
        match &mut *source {
            Source::Timer(timer) => {
                let pure = timer.fd.is_none()
                    && (timer.count == 1
                        || (timer.count == TimerInfo::INFINITE && self.multishot_timeout));
                if pure {
                    // The sqe carries a pointer to the timespec; it lives in
                    // the source so it stays valid until submission.
                    if timer.count == 1 || timer.leading {
                        timer.timespec = timespec(timer.timeout);
                        self.push(
                            opcode::Timeout::new(&timer.timespec)
                                .flags(TimeoutFlags::ETIME_SUCCESS)
                                .build()
                                .user_data(cookie),
                        );
                    } else {
                        timer.timespec = timespec(timer.interval);
                        self.push(
                            opcode::Timeout::new(&timer.timespec)
                                .flags(TimeoutFlags::MULTISHOT | TimeoutFlags::ETIME_SUCCESS)
                                .build()
                                .user_data(cookie),
                        );
                        self.registered
                            .get_mut(token)
                            .expect("registration was just checked")
                            .multishot = true;
                    }
                } else {
                    // Finite repeats (or no multishot support): a timerfd
                    // read through the ring.
                    let fd = match prepare_timer_fd(timer) {
                        Ok(fd) => fd,
                        Err(status) => return status,
                    };
                    timer.read_buf = 0;
                    let dst = &mut timer.read_buf as *mut u64 as *mut u8;
                    self.push(
                        opcode::Read::new(Fd(fd), dst, 8)
                            .build()
                            .user_data(cookie),
                    );
                }
            }
            Source::Poll(poll) => {
                let multi = poll.flags.contains(crate::PollFlags::ALLOW_MULTI);
                self.push(
                    opcode::PollAdd::new(Fd(poll.fd), poll.flags.events().bits() as u32)
                        .multi(multi)
                        .build()
                        .user_data(cookie),
                );
                self.registered
                    .get_mut(token)
                    .expect("registration was just checked")
                    .multishot = multi;
            }
            Source::Thread(thread) => {
                let mailbox = thread.mailbox.clone();
                match &*mailbox {
                    Mailbox::Futex(fx) => {
                        let futex_entry = opcode::FutexWait::new(
                            fx.word_ptr(),
                            0,
                            futex::SERVER_MASK as u64,
                            FUTEX2_SIZE_U32 | FUTEX2_PRIVATE,
                        )
                        .build()
                        .user_data(cookie);
                        let failsafe_entry = opcode::Timeout::new(&self.failsafe_ts)
                            .flags(TimeoutFlags::ETIME_SUCCESS)
                            .build()
                            .user_data(cookie | FAILSAFE_BIT);
                        let registration = self
                            .registered
                            .get_mut(token)
                            .expect("registration was just checked");
                        if !registration.futex_armed {
                            registration.futex_armed = true;
                            self.squeue.push_back(futex_entry);
                        }
                        let registration = self
                            .registered
                            .get_mut(token)
                            .expect("registration was just checked");
                        if !registration.failsafe_armed {
                            registration.failsafe_armed = true;
                            self.squeue.push_back(failsafe_entry);
                        }
                    }
                    Mailbox::Locked { .. } => {
                        let Some(fd) = &thread.fd else {
                            return Status::ErrorInvalidArgument;
                        };
                        thread.read_buf = 0;
                        let dst = &mut thread.read_buf as *mut u64 as *mut u8;
                        self.push(
                            opcode::Read::new(Fd(fd.as_raw_fd()), dst, 8)
                                .build()
                                .user_data(cookie),
                        );
                    }
                }
            }
        }
        Status::Ok
    }

    pub(crate) fn disarm(&mut self, handle: &Handle) -> Status {
        let Some(token) = handle.cell.token.take() else {
            return Status::Ok;
        };
        if let Some(registration) = self.registered.try_remove(token) {
            let cookie = pack_cookie(token, registration.serial);
            self.push(
                opcode::AsyncCancel::new(cookie)
                    .build()
                    .user_data(CANCEL),
            );
            if registration.failsafe_armed {
                self.push(
                    opcode::TimeoutRemove::new(cookie | FAILSAFE_BIT)
                        .build()
                        .user_data(IGNORED),
                );
            }
        }
        Status::Ok
    }

    pub(crate) fn submit(&mut self) -> Status {
        loop {
            let ended = self.flush_submissions();
            match self.ring.submit() {
                Ok(_) => {}
                Err(err) => match err.raw_os_error() {
                    Some(libc::EBUSY) | Some(libc::EAGAIN) => {}
                    _ => return Status::from(err),
                },
            }
            if ended {
                return Status::Ok;
            }
        }
    }

    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<RawEvent>,
    ) -> Status {
        if !self.notify_registered {
            let dst = &mut *self.notify_buf as *mut u64 as *mut u8;
            let entry = opcode::Read::new(Fd(self.notify_fd.as_raw_fd()), dst, 8)
                .build()
                .user_data(NOTIFY);
            self.push(entry);
            self.notify_registered = true;
        }

        loop {
            let ended = self.flush_submissions();
            let res = if !ended {
                self.ring.submit()
            } else {
                match timeout {
                    Some(d) if d.is_zero() => self.ring.submit(),
                    Some(d) => {
                        let ts = timespec(d);
                        let args = SubmitArgs::new().timespec(&ts);
                        self.ring.submitter().submit_with_args(1, &args)
                    }
                    None => self.ring.submit_and_wait(1),
                }
            };
            match res {
                Ok(_) => {}
                Err(err) => match err.raw_os_error() {
                    Some(libc::ETIME) => {}
                    Some(libc::EBUSY) | Some(libc::EAGAIN) => {}
                    Some(libc::EINTR) => return Status::ErrorInterrupted,
                    _ => return Status::from(err),
                },
            }
            self.drain_completions(events);
            if ended {
                break;
            }
        }
        Status::Ok
    }

    fn drain_completions(&mut self, events: &mut Vec<RawEvent>) {
        let mut cq = self.ring.completion();
        cq.sync();
        let entries: Vec<cqueue::Entry> = cq.collect();

        for entry in entries {
            match entry.user_data() {
                CANCEL | IGNORED => {}
                NOTIFY => {
                    self.notify_registered = false;
                    drain_packets(&self.packets, events);
                }
                user_data => {
                    let failsafe = user_data & FAILSAFE_BIT != 0;
                    let (token, serial) = unpack_cookie(user_data & !FAILSAFE_BIT);
                    let Some(registration) = self.registered.get_mut(token) else {
                        continue;
                    };
                    if registration.serial != serial {
                        continue;
                    }
                    let handle = registration.handle.clone();
                    let more = cqueue::more(entry.flags());
                    let result = entry.result();

                    if failsafe {
                        registration.failsafe_armed = false;
                        if handle.kind() == HandleKind::Thread {
                            events.push(RawEvent::Event {
                                handle,
                                data: NotifyData {
                                    result: 0,
                                    flags: 0,
                                    rearm: true,
                                },
                            });
                        }
                        continue;
                    }

                    if !more {
                        registration.multishot = false;
                    }

                    let data = match handle.kind() {
                        HandleKind::Timer => match timer_cqe(&handle, result) {
                            TimerCqe::Skip => continue,
                            TimerCqe::Ticks(ticks) => NotifyData {
                                result: ticks as i64,
                                flags: 0,
                                rearm: !more,
                            },
                            // Surfaced through the notify path, where the
                            // handle can be cancelled safely.
                            TimerCqe::Error(errno) => NotifyData {
                                result: -(errno as i64),
                                flags: 0,
                                rearm: false,
                            },
                        },
                        HandleKind::Poll => {
                            if result == -libc::ECANCELED {
                                continue;
                            }
                            if result < 0 {
                                NotifyData {
                                    result: result as i64,
                                    flags: 0,
                                    rearm: false,
                                }
                            } else {
                                NotifyData {
                                    result: 0,
                                    flags: result as u32,
                                    rearm: !more,
                                }
                            }
                        }
                        HandleKind::Thread => {
                            registration.futex_armed = false;
                            if result == -libc::ECANCELED {
                                continue;
                            }
                            NotifyData {
                                // A futex wait completing with EAGAIN means
                                // the word was already dirty: still a wake.
                                result: if result < 0 && result != -libc::EAGAIN {
                                    result as i64
                                } else {
                                    0
                                },
                                flags: 0,
                                rearm: true,
                            }
                        }
                    };
                    events.push(RawEvent::Event { handle, data });
                }
            }
        }
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::Eventfd {
            packets: self.packets.clone(),
            fd: self.notify_fd.clone(),
        }
    }

    pub(crate) fn create_thread_source(&mut self) -> Result<ThreadSource, Status> {
        if self.futex_supported {
            return Ok(ThreadSource {
                mailbox: Arc::new(Mailbox::Futex(futex::FutexQueue::new(VecDeque::new()))),
                local: VecDeque::new(),
                fd: None,
                read_buf: 0,
            });
        }
        let fd = Arc::new(
            eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).map_err(Status::from)?,
        );
        Ok(ThreadSource {
            mailbox: Arc::new(Mailbox::Locked {
                queue: Mutex::new(VecDeque::new()),
                signal: ThreadSignal::Eventfd(fd.clone()),
            }),
            local: VecDeque::new(),
            fd: Some(fd),
            read_buf: 0,
        })
    }

    pub(crate) fn supports_timer_reset(&self, handle: &Handle, count: u32) -> bool {
        // A pure-ring timeout can only be retargeted to one shot or to an
        // endless multishot; everything else needs the timerfd shape the
        // handle was not created with.
        let mut source = handle.cell.source.borrow_mut();
        match &mut *source {
            Source::Timer(timer) if timer.fd.is_none() => {
                count == 1 || count == TimerInfo::INFINITE
            }
            _ => true,
        }
    }
}

enum TimerCqe {
    /// Stale cancel acknowledgment or spurious wake.
    Skip,
    Ticks(u64),
    Error(i32),
}

fn timer_cqe(handle: &Handle, result: i32) -> TimerCqe {
    if result == -libc::ECANCELED {
        return TimerCqe::Skip;
    }
    let mut source = handle.cell.source.borrow_mut();
    let timer = source.as_timer();
    if timer.fd.is_some() {
        // timerfd read: the landing pad holds the expiration count.
        match result {
            8 => TimerCqe::Ticks(timer.read_buf.max(1)),
            r if r < 0 => TimerCqe::Error(-r),
            _ => TimerCqe::Skip,
        }
    } else if result == 0 || result == -libc::ETIME {
        TimerCqe::Ticks(1)
    } else {
        TimerCqe::Error(-result)
    }
}

fn timespec(duration: Duration) -> Timespec {
    Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    let release = rustix::system::uname();
    let release = release.release().to_string_lossy();
    let mut parts = release.split(['.', '-']);
    let found_major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let found_minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (found_major, found_minor) >= (major, minor)
}
