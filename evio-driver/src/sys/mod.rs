//! Platform backends. Exactly one is active per queue, selected at
//! creation from the permitted engine mask in platform preference order.

use std::{sync::Arc, time::Duration};

use crossbeam_queue::SegQueue;

use crate::{
    handle::Handle,
    queue::{QueueEngine, QueueInfo, RawEvent, WakeupPacket},
    thread::ThreadSource,
    RawFd, Status,
};

cfg_if::cfg_if! {
    if #[cfg(io_uring)] {
        pub(crate) mod iour;
    }
}
cfg_if::cfg_if! {
    if #[cfg(epoll_like)] {
        mod epoll;
    }
}
cfg_if::cfg_if! {
    if #[cfg(kqueue_like)] {
        mod kqueue;
    }
}
cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod iocp;
    }
}

/// The active backend of one queue.
pub(crate) enum Driver {
    #[cfg(io_uring)]
    Iour(iour::IourDriver),
    #[cfg(epoll_like)]
    EPoll(epoll::EPollDriver),
    #[cfg(kqueue_like)]
    KQueue(kqueue::KQueueDriver),
    #[cfg(windows)]
    Iocp(iocp::IocpDriver),
}

macro_rules! dispatch {
    ($self:expr, $driver:pat => $body:expr) => {
        match $self {
            #[cfg(io_uring)]
            Driver::Iour($driver) => $body,
            #[cfg(epoll_like)]
            Driver::EPoll($driver) => $body,
            #[cfg(kqueue_like)]
            Driver::KQueue($driver) => $body,
            #[cfg(windows)]
            Driver::Iocp($driver) => $body,
        }
    };
}

impl Driver {
    /// Try each permitted backend in platform preference order and adopt
    /// the first one that initializes.
    pub(crate) fn create(info: &QueueInfo) -> Result<(Driver, QueueEngine), Status> {
        let mask = info.engine_mask;

        #[cfg(io_uring)]
        if mask.contains(QueueEngine::URING) {
            match iour::IourDriver::create(info) {
                Ok(driver) => return Ok((Driver::Iour(driver), QueueEngine::URING)),
                Err(status) => {
                    evio_log::debug!("io_uring backend unavailable: {status}");
                }
            }
        }

        #[cfg(epoll_like)]
        if mask.intersects(QueueEngine::EPOLL | QueueEngine::ALOOPER) {
            let driver = epoll::EPollDriver::create(info)?;
            return Ok((Driver::EPoll(driver), QueueEngine::EPOLL));
        }

        #[cfg(kqueue_like)]
        if mask.intersects(QueueEngine::KQUEUE | QueueEngine::RUN_LOOP) {
            let driver = kqueue::KQueueDriver::create(info)?;
            return Ok((Driver::KQueue(driver), QueueEngine::KQUEUE));
        }

        #[cfg(windows)]
        if mask.contains(QueueEngine::IOCP) {
            let driver = iocp::IocpDriver::create(info)?;
            return Ok((Driver::Iocp(driver), QueueEngine::IOCP));
        }

        evio_log::error!("no permitted backend is available on this platform");
        Err(Status::ErrorNotImplemented)
    }

    /// Register the handle's source with the kernel, or re-register it
    /// after a consumed delivery.
    pub(crate) fn arm(&mut self, handle: &Handle) -> Status {
        dispatch!(self, driver => driver.arm(handle))
    }

    /// Retire the handle's kernel registration. Idempotent; late
    /// completions are discarded by the serial embedded in the cookie.
    pub(crate) fn disarm(&mut self, handle: &Handle) -> Status {
        dispatch!(self, driver => driver.disarm(handle))
    }

    /// Flush gathered submissions to the kernel.
    pub(crate) fn submit(&mut self) -> Status {
        dispatch!(self, driver => driver.submit())
    }

    /// Wait up to `timeout` (`None` blocks indefinitely) and translate
    /// everything the kernel delivered into [`RawEvent`]s.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<RawEvent>) -> Status {
        dispatch!(self, driver => driver.wait(timeout, events))
    }

    pub(crate) fn waker(&self) -> Waker {
        dispatch!(self, driver => driver.waker())
    }

    pub(crate) fn create_thread_source(&mut self) -> Result<ThreadSource, Status> {
        dispatch!(self, driver => driver.create_thread_source())
    }

    /// Whether `reset` can retarget this timer to `count` firings without
    /// re-creating the handle.
    pub(crate) fn supports_timer_reset(&self, handle: &Handle, count: u32) -> bool {
        dispatch!(self, driver => driver.supports_timer_reset(handle, count))
    }
}

/// Wakeup packets posted by other threads, drained by the owning loop.
/// A queue (rather than a bit word) keeps distinct packets distinct.
pub(crate) type PacketQueue = SegQueue<u32>;

pub(crate) fn drain_packets(packets: &PacketQueue, events: &mut Vec<RawEvent>) {
    while let Some(bits) = packets.pop() {
        events.push(RawEvent::Wakeup(WakeupPacket::decode(bits)));
    }
}

/// Cross-thread wakeup endpoint of the active backend.
#[derive(Clone)]
pub(crate) enum Waker {
    #[cfg(any(io_uring, epoll_like))]
    Eventfd {
        packets: Arc<PacketQueue>,
        fd: Arc<std::os::fd::OwnedFd>,
    },
    #[cfg(kqueue_like)]
    Kevent {
        packets: Arc<PacketQueue>,
        kq: Arc<std::os::fd::OwnedFd>,
    },
    #[cfg(windows)]
    Port {
        packets: Arc<PacketQueue>,
        port: iocp::PortRef,
    },
}

impl Waker {
    pub(crate) fn wakeup(&self, packet: WakeupPacket) -> Status {
        match self {
            #[cfg(any(io_uring, epoll_like))]
            Waker::Eventfd { packets, fd } => {
                packets.push(packet.encode());
                write_eventfd(fd)
            }
            #[cfg(kqueue_like)]
            Waker::Kevent { packets, kq } => {
                packets.push(packet.encode());
                kqueue::trigger_user_event(kq, kqueue::WAKER_IDENT)
            }
            #[cfg(windows)]
            Waker::Port { packets, port } => {
                packets.push(packet.encode());
                port.post(iocp::WAKER_KEY)
            }
        }
    }
}

/// Backend primitive a [`ThreadSender`](crate::ThreadSender) rings to wake
/// the owning loop.
pub(crate) enum ThreadSignal {
    #[cfg(any(io_uring, epoll_like))]
    Eventfd(Arc<std::os::fd::OwnedFd>),
    #[cfg(kqueue_like)]
    Kevent {
        kq: Arc<std::os::fd::OwnedFd>,
        ident: usize,
    },
    #[cfg(windows)]
    Port { port: iocp::PortRef, key: usize },
}

impl ThreadSignal {
    pub(crate) fn signal(&self) -> Status {
        match self {
            #[cfg(any(io_uring, epoll_like))]
            ThreadSignal::Eventfd(fd) => write_eventfd(fd),
            #[cfg(kqueue_like)]
            ThreadSignal::Kevent { kq, ident } => kqueue::trigger_user_event(kq, *ident),
            #[cfg(windows)]
            ThreadSignal::Port { port, key } => port.post(*key),
        }
    }
}

#[cfg(any(io_uring, epoll_like))]
pub(crate) fn write_eventfd(fd: &std::os::fd::OwnedFd) -> Status {
    match rustix::io::write(fd, &1u64.to_ne_bytes()) {
        Ok(_) => Status::Ok,
        // The counter is saturated; the loop is overdue for a wakeup anyway.
        Err(rustix::io::Errno::AGAIN) => Status::Ok,
        Err(errno) => Status::from(errno),
    }
}

/// Drain an eventfd-style counter down to zero.
#[cfg(any(io_uring, epoll_like))]
pub(crate) fn drain_eventfd(fd: &std::os::fd::OwnedFd) -> u64 {
    let mut total = 0u64;
    let mut buf = [0u8; 8];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(8) => total = total.saturating_add(u64::from_ne_bytes(buf)),
            _ => break,
        }
    }
    total
}

/// Create and program the backing timerfd if this is the first arm of the
/// schedule; a suspended timer keeps its descriptor ticking.
#[cfg(any(io_uring, epoll_like))]
pub(crate) fn prepare_timer_fd(
    timer: &mut crate::timer::TimerSource,
) -> Result<std::os::fd::RawFd, Status> {
    use std::os::fd::AsRawFd;

    use rustix::time::{
        timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags,
        TimerfdTimerFlags,
    };

    if timer.fd.is_none() {
        let clock = match timer.clock {
            crate::ClockType::Realtime => TimerfdClockId::Realtime,
            _ => TimerfdClockId::Monotonic,
        };
        let fd = timerfd_create(clock, TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC)
            .map_err(Status::from)?;
        timer.fd = Some(fd);
        timer.programmed = false;
    }
    let fd = timer.fd.as_ref().expect("timer fd was just created");
    if !timer.programmed {
        let spec = Itimerspec {
            it_interval: unix_timespec(timer.interval),
            it_value: unix_timespec(timer.timeout),
        };
        timerfd_settime(fd, TimerfdTimerFlags::empty(), &spec).map_err(Status::from)?;
        timer.programmed = true;
    }
    Ok(fd.as_raw_fd())
}

#[cfg(any(io_uring, epoll_like))]
pub(crate) fn unix_timespec(duration: Duration) -> rustix::time::Timespec {
    rustix::time::Timespec {
        tv_sec: duration.as_secs() as _,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

pub(crate) fn close_raw_fd(fd: RawFd) {
    #[cfg(unix)]
    unsafe {
        libc::close(fd);
    }
    #[cfg(windows)]
    unsafe {
        windows_sys::Win32::Foundation::CloseHandle(fd as _);
    }
}

/// Pack a registration slot and an epoch serial into a kernel cookie.
pub(crate) fn pack_cookie(token: usize, serial: u32) -> u64 {
    (token as u64) | ((serial as u64 & 0xFFFF) << 32)
}

pub(crate) fn unpack_cookie(cookie: u64) -> (usize, u32) {
    ((cookie & 0xFFFF_FFFF) as usize, ((cookie >> 32) & 0xFFFF) as u32)
}

/// The serial snapshot a handle embeds while armed.
pub(crate) fn serial_of(handle: &Handle) -> u32 {
    handle.timeline() & 0xFFFF
}
