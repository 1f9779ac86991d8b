//! kqueue backend: `EVFILT_TIMER` timers, level-triggered read/write
//! filters, `EVFILT_USER` wakeups. Serves the `KQUEUE` and `RUN_LOOP`
//! engine tiers.

use std::{
    collections::VecDeque,
    os::fd::OwnedFd,
    sync::{Arc, Mutex},
    time::Duration,
};

use rustix::event::kqueue::{
    kevent, kqueue, Event, EventFilter, EventFlags, UserDefinedFlags, UserFlags,
};
use slab::Slab;

use crate::{
    handle::{Handle, HandleKind, Source},
    pollable::PollFlags,
    queue::{NotifyData, QueueInfo, RawEvent},
    sys::{drain_packets, pack_cookie, serial_of, unpack_cookie, PacketQueue, ThreadSignal, Waker},
    thread::{Mailbox, ThreadSource},
    Status,
};

const WAKER_COOKIE: u64 = u64::MAX;
pub(crate) const WAKER_IDENT: usize = 0;

struct Registration {
    handle: Handle,
    serial: u32,
    /// The kernel drops the registration after one delivery.
    oneshot: bool,
}

pub(crate) struct KQueueDriver {
    kq: Arc<OwnedFd>,
    event_capacity: usize,
    registered: Slab<Registration>,
    packets: Arc<PacketQueue>,
    next_user_ident: usize,
}

impl KQueueDriver {
    pub(crate) fn create(info: &QueueInfo) -> Result<Self, Status> {
        let kq = Arc::new(kqueue().map_err(Status::from)?);

        // The waker is a user event registered for the queue's lifetime.
        let change = Event::new(
            EventFilter::User {
                ident: WAKER_IDENT as _,
                flags: UserFlags::empty(),
                user_flags: UserDefinedFlags::new(0),
            },
            EventFlags::ADD | EventFlags::CLEAR,
            WAKER_COOKIE as isize,
        );
        let mut out = Vec::new();
        unsafe { kevent(&*kq, &[change], &mut out, None) }.map_err(Status::from)?;

        let mut event_capacity = info.complete_queue_size;
        if event_capacity == 0 {
            event_capacity = info.submit_queue_size;
        }

        Ok(Self {
            kq,
            event_capacity: event_capacity.max(1) as usize,
            registered: Slab::new(),
            packets: Arc::new(PacketQueue::new()),
            next_user_ident: 1,
        })
    }

    fn apply(&self, changes: &[Event]) -> Status {
        let mut out = Vec::new();
        match unsafe { kevent(&*self.kq, changes, &mut out, None) } {
            Ok(_) => Status::Ok,
            Err(errno) => Status::from(errno),
        }
    }

    pub(crate) fn arm(&mut self, handle: &Handle) -> Status {
        let serial = serial_of(handle);
        let token = match handle.cell.token.get() {
            Some(token) => token,
            None => {
                let token = self.registered.insert(Registration {
                    handle: handle.clone(),
                    serial,
                    oneshot: false,
                });
                handle.cell.token.set(Some(token));
                token
            }
        };
        let cookie = pack_cookie(token, serial) as isize;

        let mut source = handle.cell.source.borrow_mut();
        let status = match &mut *source {
            Source::Timer(timer) => {
                let oneshot = timer.count == 1 || timer.leading;
                let period = if timer.leading {
                    timer.timeout
                } else {
                    timer.interval
                };
                let mut flags = EventFlags::ADD;
                if oneshot {
                    flags |= EventFlags::ONESHOT;
                }
                if let Some(registration) = self.registered.get_mut(token) {
                    registration.oneshot = oneshot;
                }
                self.apply(&[Event::new(
                    EventFilter::Timer {
                        ident: token as _,
                        timer: Some(period),
                    },
                    flags,
                    cookie,
                )])
            }
            Source::Poll(poll) => {
                let mut changes = Vec::with_capacity(2);
                if poll.flags.contains(PollFlags::IN) {
                    changes.push(Event::new(
                        EventFilter::Read(poll.fd),
                        EventFlags::ADD,
                        cookie,
                    ));
                }
                if poll.flags.contains(PollFlags::OUT) {
                    changes.push(Event::new(
                        EventFilter::Write(poll.fd),
                        EventFlags::ADD,
                        cookie,
                    ));
                }
                if changes.is_empty() {
                    return Status::ErrorInvalidArgument;
                }
                self.apply(&changes)
            }
            Source::Thread(thread) => {
                let status = self.apply(&[Event::new(
                    EventFilter::User {
                        ident: thread.ident as _,
                        flags: UserFlags::empty(),
                        user_flags: UserDefinedFlags::new(0),
                    },
                    EventFlags::ADD | EventFlags::CLEAR,
                    cookie,
                )]);
                // Triggers raised while the handle was suspended were lost
                // with the old registration; recover them.
                if status == Status::Ok && !thread.mailbox.is_empty() {
                    trigger_user_event(&self.kq, thread.ident);
                }
                status
            }
        };
        if status != Status::Ok {
            self.registered.try_remove(token);
            handle.cell.token.set(None);
        }
        status
    }

    pub(crate) fn disarm(&mut self, handle: &Handle) -> Status {
        let Some(token) = handle.cell.token.take() else {
            return Status::Ok;
        };
        let registration = self.registered.try_remove(token);

        let mut source = handle.cell.source.borrow_mut();
        let changes: Vec<Event> = match &mut *source {
            Source::Timer(_) => {
                if registration.is_some_and(|r| r.oneshot) {
                    // Consumed by the kernel already.
                    Vec::new()
                } else {
                    vec![Event::new(
                        EventFilter::Timer {
                            ident: token as _,
                            timer: None,
                        },
                        EventFlags::DELETE,
                        0,
                    )]
                }
            }
            Source::Poll(poll) => {
                let mut changes = Vec::with_capacity(2);
                if poll.flags.contains(PollFlags::IN) {
                    changes.push(Event::new(
                        EventFilter::Read(poll.fd),
                        EventFlags::DELETE,
                        0,
                    ));
                }
                if poll.flags.contains(PollFlags::OUT) {
                    changes.push(Event::new(
                        EventFilter::Write(poll.fd),
                        EventFlags::DELETE,
                        0,
                    ));
                }
                changes
            }
            Source::Thread(thread) => vec![Event::new(
                EventFilter::User {
                    ident: thread.ident as _,
                    flags: UserFlags::empty(),
                    user_flags: UserDefinedFlags::new(0),
                },
                EventFlags::DELETE,
                0,
            )],
        };
        drop(source);

        if changes.is_empty() {
            return Status::Ok;
        }
        match self.apply(&changes) {
            // Already gone; a oneshot may have fired in between.
            Status::ErrorNotFound => Status::Ok,
            status => status,
        }
    }

    pub(crate) fn submit(&mut self) -> Status {
        // Changes reach the kernel in arm(); nothing is gathered.
        Status::Ok
    }

    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<RawEvent>,
    ) -> Status {
        let mut received: Vec<Event> = Vec::with_capacity(self.event_capacity);
        match unsafe { kevent(&*self.kq, &[], &mut received, timeout) } {
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) => return Status::ErrorInterrupted,
            Err(errno) => return Status::from(errno),
        }

        for event in &received {
            let cookie = event.udata() as u64;
            if cookie == WAKER_COOKIE {
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
                HandleKind::Timer => NotifyData {
                    result: 1,
                    flags: 0,
                    rearm: registration.oneshot,
                },
                HandleKind::Poll => {
                    let mut flags = match event.filter() {
                        EventFilter::Read(_) => PollFlags::IN,
                        EventFilter::Write(_) => PollFlags::OUT,
                        _ => PollFlags::empty(),
                    };
                    if event.flags().contains(EventFlags::EOF) {
                        flags |= PollFlags::HUNG_UP;
                    }
                    if event.flags().contains(EventFlags::ERROR) {
                        flags |= PollFlags::ERR;
                    }
                    NotifyData {
                        result: 0,
                        flags: flags.bits() as u32,
                        rearm: false,
                    }
                }
                HandleKind::Thread => NotifyData {
                    result: 0,
                    flags: 0,
                    rearm: false,
                },
            };
            events.push(RawEvent::Event { handle, data });
        }
        Status::Ok
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::Kevent {
            packets: self.packets.clone(),
            kq: self.kq.clone(),
        }
    }

    pub(crate) fn create_thread_source(&mut self) -> Result<ThreadSource, Status> {
        let ident = self.next_user_ident;
        self.next_user_ident += 1;
        Ok(ThreadSource {
            mailbox: Arc::new(Mailbox::Locked {
                queue: Mutex::new(VecDeque::new()),
                signal: ThreadSignal::Kevent {
                    kq: self.kq.clone(),
                    ident,
                },
            }),
            local: VecDeque::new(),
            ident,
        })
    }

    pub(crate) fn supports_timer_reset(&self, _handle: &Handle, _count: u32) -> bool {
        true
    }
}

/// Raise an `EVFILT_USER` event on `ident`. Refused triggers (the event is
/// not registered while its handle is suspended) are dropped on purpose.
pub(crate) fn trigger_user_event(kq: &OwnedFd, ident: usize) -> Status {
    let change = Event::new(
        EventFilter::User {
            ident: ident as _,
            flags: UserFlags::TRIGGER,
            user_flags: UserDefinedFlags::new(0),
        },
        EventFlags::empty(),
        0,
    );
    let mut out = Vec::new();
    match unsafe { kevent(kq, &[change], &mut out, Some(Duration::ZERO)) } {
        Ok(_) => Status::Ok,
        Err(rustix::io::Errno::NOENT) => Status::Ok,
        Err(errno) => Status::from(errno),
    }
}
