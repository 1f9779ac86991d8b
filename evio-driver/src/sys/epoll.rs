//! epoll backend: level-triggered registrations, timerfd timers, eventfd
//! wakeups. Serves the `EPOLL` and `ALOOPER` engine tiers.

use std::{
    collections::VecDeque,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    sync::{Arc, Mutex},
    time::Duration,
};

use rustix::event::{epoll, eventfd, EventfdFlags};
use slab::Slab;

use crate::{
    handle::{Handle, HandleKind, Source},
    pollable::PollFlags,
    queue::{NotifyData, QueueInfo, RawEvent},
    sys::{
        drain_eventfd, drain_packets, pack_cookie, prepare_timer_fd, serial_of, unpack_cookie,
        PacketQueue, ThreadSignal, Waker,
    },
    thread::{Mailbox, ThreadSource},
    Status,
};

const WAKER_COOKIE: u64 = u64::MAX;

struct Registration {
    handle: Handle,
    serial: u32,
}

pub(crate) struct EPollDriver {
    epoll: OwnedFd,
    event_capacity: usize,
    registered: Slab<Registration>,
    packets: Arc<PacketQueue>,
    wakeup_fd: Arc<OwnedFd>,
}

impl EPollDriver {
    pub(crate) fn create(info: &QueueInfo) -> Result<Self, Status> {
        let epoll_fd = epoll::create(epoll::CreateFlags::CLOEXEC).map_err(Status::from)?;
        let wakeup_fd = Arc::new(
            eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).map_err(Status::from)?,
        );
        epoll::add(
            &epoll_fd,
            &*wakeup_fd,
            epoll::EventData::new_u64(WAKER_COOKIE),
            epoll::EventFlags::IN,
        )
        .map_err(Status::from)?;

        let mut event_capacity = info.complete_queue_size;
        if event_capacity == 0 {
            event_capacity = info.submit_queue_size;
        }

        Ok(Self {
            epoll: epoll_fd,
            event_capacity: event_capacity.max(1) as usize,
            registered: Slab::new(),
            packets: Arc::new(PacketQueue::new()),
            wakeup_fd,
        })
    }

    pub(crate) fn arm(&mut self, handle: &Handle) -> Status {
        let mut source = handle.cell.source.borrow_mut();
        let fd = match &mut *source {
            Source::Timer(timer) => match prepare_timer_fd(timer) {
                Ok(fd) => fd,
                Err(status) => return status,
            },
            Source::Poll(poll) => poll.fd,
            Source::Thread(thread) => match &thread.fd {
                Some(fd) => fd.as_raw_fd(),
                None => return Status::ErrorInvalidArgument,
            },
        };
        let flags = match &mut *source {
            Source::Poll(poll) => poll_to_epoll(poll.flags),
            _ => epoll::EventFlags::IN,
        };
        drop(source);

        let serial = serial_of(handle);
        let token = self.registered.insert(Registration {
            handle: handle.clone(),
            serial,
        });
        let res = epoll::add(
            &self.epoll,
            unsafe { BorrowedFd::borrow_raw(fd) },
            epoll::EventData::new_u64(pack_cookie(token, serial)),
            flags,
        );
        if let Err(errno) = res {
            self.registered.remove(token);
            return Status::from(errno);
        }
        handle.cell.token.set(Some(token));
        Status::Ok
    }

    pub(crate) fn disarm(&mut self, handle: &Handle) -> Status {
        let Some(token) = handle.cell.token.take() else {
            return Status::Ok;
        };
        self.registered.try_remove(token);

        let mut source = handle.cell.source.borrow_mut();
        let fd = match &mut *source {
            Source::Timer(timer) => match &timer.fd {
                // The descriptor keeps ticking while suspended; only the
                // epoll registration is retired.
                Some(fd) => fd.as_raw_fd(),
                None => return Status::Ok,
            },
            Source::Poll(poll) => poll.fd,
            Source::Thread(thread) => match &thread.fd {
                Some(fd) => fd.as_raw_fd(),
                None => return Status::Ok,
            },
        };
        drop(source);

        match epoll::delete(&self.epoll, unsafe { BorrowedFd::borrow_raw(fd) }) {
            Ok(()) => Status::Ok,
            // Already gone (e.g. the user closed the descriptor).
            Err(rustix::io::Errno::NOENT) | Err(rustix::io::Errno::BADF) => Status::Ok,
            Err(errno) => Status::from(errno),
        }
    }

    pub(crate) fn submit(&mut self) -> Status {
        // Registrations reach the kernel in arm(); nothing is gathered.
        Status::Ok
    }

    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<RawEvent>,
    ) -> Status {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) if d.is_zero() => 0,
            Some(d) => (d.as_millis().min(i32::MAX as u128) as i32).max(1),
        };

        let mut received = epoll::EventVec::with_capacity(self.event_capacity);
        match epoll::wait(&self.epoll, &mut received, timeout_ms) {
            Ok(()) => {}
            Err(rustix::io::Errno::INTR) => return Status::ErrorInterrupted,
            Err(errno) => return Status::from(errno),
        }

        for event in received.iter() {
            let cookie = event.data.u64();
            if cookie == WAKER_COOKIE {
                drain_eventfd(&self.wakeup_fd);
                drain_packets(&self.packets, events);
                continue;
            }
            let (token, serial) = unpack_cookie(cookie);
            let Some(registration) = self.registered.get(token) else {
                continue;
            };
            if registration.serial != serial {
                continue;
            }
            let handle = registration.handle.clone();
            let data = match handle.kind() {
                HandleKind::Timer => {
                    let ticks = read_timer_ticks(&handle);
                    if ticks == 0 {
                        continue;
                    }
                    NotifyData {
                        result: ticks as i64,
                        flags: 0,
                        rearm: false,
                    }
                }
                HandleKind::Poll => NotifyData {
                    result: 0,
                    flags: epoll_to_poll(event.flags).bits() as u32,
                    rearm: false,
                },
                HandleKind::Thread => {
                    let mut source = handle.cell.source.borrow_mut();
                    if let Some(fd) = &source.as_thread().fd {
                        drain_eventfd(fd);
                    }
                    drop(source);
                    NotifyData {
                        result: 0,
                        flags: 0,
                        rearm: false,
                    }
                }
            };
            events.push(RawEvent::Event { handle, data });
        }
        Status::Ok
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::Eventfd {
            packets: self.packets.clone(),
            fd: self.wakeup_fd.clone(),
        }
    }

    pub(crate) fn create_thread_source(&mut self) -> Result<ThreadSource, Status> {
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
            #[cfg(io_uring)]
            read_buf: 0,
        })
    }

    pub(crate) fn supports_timer_reset(&self, _handle: &Handle, _count: u32) -> bool {
        // timerfd expresses any repeat count; saturation is accounted in
        // userspace.
        true
    }
}

fn read_timer_ticks(handle: &Handle) -> u64 {
    let mut source = handle.cell.source.borrow_mut();
    let timer = source.as_timer();
    let Some(fd) = &timer.fd else {
        return 0;
    };
    let mut total = 0u64;
    let mut buf = [0u8; 8];
    while let Ok(8) = rustix::io::read(fd, &mut buf) {
        total = total.saturating_add(u64::from_ne_bytes(buf));
    }
    total
}

fn poll_to_epoll(flags: PollFlags) -> epoll::EventFlags {
    let mut out = epoll::EventFlags::empty();
    if flags.contains(PollFlags::IN) {
        out |= epoll::EventFlags::IN;
    }
    if flags.contains(PollFlags::PRI) {
        out |= epoll::EventFlags::PRI;
    }
    if flags.contains(PollFlags::OUT) {
        out |= epoll::EventFlags::OUT;
    }
    out
}

fn epoll_to_poll(flags: epoll::EventFlags) -> PollFlags {
    let mut out = PollFlags::empty();
    if flags.contains(epoll::EventFlags::IN) {
        out |= PollFlags::IN;
    }
    if flags.contains(epoll::EventFlags::PRI) {
        out |= PollFlags::PRI;
    }
    if flags.contains(epoll::EventFlags::OUT) {
        out |= PollFlags::OUT;
    }
    if flags.contains(epoll::EventFlags::ERR) {
        out |= PollFlags::ERR;
    }
    if flags.intersects(epoll::EventFlags::HUP | epoll::EventFlags::RDHUP) {
        out |= PollFlags::HUNG_UP;
    }
    out
}
