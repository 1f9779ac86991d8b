use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};

use evio_driver::{Queue, QueueInfo, QueueWakeupInfo, Status, TimerInfo, WakeupFlags};

fn queue() -> Queue {
    Queue::create(QueueInfo::default()).unwrap()
}

#[test]
fn one_shot() {
    let queue = queue();
    let events = Rc::new(RefCell::new(Vec::new()));

    let start = Instant::now();
    let q = queue.clone();
    let recorded = events.clone();
    queue
        .schedule_timer(
            TimerInfo::once(Duration::from_millis(50)),
            move |_, value, status| {
                recorded.borrow_mut().push((value, status));
                if status == Status::Done {
                    q.wakeup(WakeupFlags::GRACEFUL);
                }
            },
        )
        .unwrap();

    let status = queue.run(None, QueueWakeupInfo::default());
    let elapsed = start.elapsed();

    assert_eq!(status, Status::Ok);
    assert_eq!(
        events.borrow().as_slice(),
        &[(1, Status::Ok), (1, Status::Done)]
    );
    assert!(elapsed >= Duration::from_millis(45), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "fired late: {elapsed:?}");
}

#[test]
fn repeating_cancel_mid_stream() {
    let queue = queue();
    let events = Rc::new(RefCell::new(Vec::new()));

    let q = queue.clone();
    let recorded = events.clone();
    queue
        .schedule_timer(
            TimerInfo::repeating(Duration::from_millis(10), TimerInfo::INFINITE),
            move |handle, value, status| {
                recorded.borrow_mut().push((value, status));
                if status == Status::Ok && value >= 5 {
                    assert_eq!(handle.cancel_with(Status::Done, 5), Status::Ok);
                    q.wakeup(WakeupFlags::GRACEFUL);
                }
            },
        )
        .unwrap();

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);

    {
        let events = events.borrow();
        let (last, firing) = events.split_last().unwrap();
        assert_eq!(*last, (5, Status::Done));
        assert!(!firing.is_empty());
        assert!(firing.iter().all(|(_, st)| *st == Status::Ok));
        assert!(firing.windows(2).all(|w| w[0].0 < w[1].0));
    }

    // No further completions after the terminal one.
    let before = events.borrow().len();
    queue.run(Some(Duration::from_millis(50)), QueueWakeupInfo::default());
    assert_eq!(events.borrow().len(), before);
}

#[test]
fn run_timeout_returns_done() {
    let queue = queue();
    let start = Instant::now();
    let status = queue.run(Some(Duration::from_millis(30)), QueueWakeupInfo::default());
    assert_eq!(status, Status::Done);
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn count_saturation() {
    let queue = queue();
    let events = Rc::new(RefCell::new(Vec::new()));

    let q = queue.clone();
    let recorded = events.clone();
    queue
        .schedule_timer(
            TimerInfo::repeating(Duration::from_millis(5), 3),
            move |_, value, status| {
                recorded.borrow_mut().push((value, status));
                if status == Status::Done {
                    q.wakeup(WakeupFlags::GRACEFUL);
                }
            },
        )
        .unwrap();

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);

    let events = events.borrow();
    let (last, firing) = events.split_last().unwrap();
    assert_eq!(*last, (3, Status::Done));
    assert!(firing.iter().all(|(value, st)| *st == Status::Ok && *value <= 3));
}

#[test]
fn invalid_parameters_are_refused() {
    let queue = queue();
    let err = queue
        .schedule_timer(TimerInfo::default(), |_, _, _| {})
        .unwrap_err();
    assert_eq!(err, Status::ErrorInvalidArgument);

    let err = queue
        .schedule_timer(
            TimerInfo {
                count: 0,
                timeout: Duration::from_millis(10),
                ..Default::default()
            },
            |_, _, _| {},
        )
        .unwrap_err();
    assert_eq!(err, Status::ErrorInvalidArgument);
}

#[test]
fn unsupported_clock_is_refused() {
    let queue = queue();
    let err = queue
        .schedule_timer(
            TimerInfo {
                timeout: Duration::from_millis(10),
                clock: evio_driver::ClockType::Process,
                ..Default::default()
            },
            |_, _, _| {},
        )
        .unwrap_err();
    assert_eq!(err, Status::ErrorNotImplemented);
}

#[test]
fn schedule_wrapper_reports_success() {
    let queue = queue();
    let fired = Rc::new(RefCell::new(None));

    let q = queue.clone();
    let result = fired.clone();
    queue
        .schedule(Duration::from_millis(20), move |_, success| {
            *result.borrow_mut() = Some(success);
            q.wakeup(WakeupFlags::GRACEFUL);
        })
        .unwrap();

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);
    assert_eq!(*fired.borrow(), Some(true));
}

#[test]
fn schedule_wrapper_reports_cancellation() {
    let queue = queue();
    let fired = Rc::new(RefCell::new(None));

    let result = fired.clone();
    let handle = queue
        .schedule(Duration::from_secs(60), move |_, success| {
            *result.borrow_mut() = Some(success);
        })
        .unwrap();

    assert_eq!(handle.cancel(), Status::Ok);
    assert_eq!(*fired.borrow(), Some(false));
    assert_eq!(handle.cancel(), Status::ErrorAlreadyPerformed);
}

#[test]
fn nested_run_inside_completion() {
    let queue = queue();
    let inner_status = Rc::new(RefCell::new(None));

    let q = queue.clone();
    let inner = inner_status.clone();
    queue
        .schedule(Duration::from_millis(10), move |_, success| {
            assert!(success);
            let status = q.run(Some(Duration::from_millis(15)), QueueWakeupInfo::default());
            *inner.borrow_mut() = Some(status);
            q.wakeup(WakeupFlags::GRACEFUL);
        })
        .unwrap();

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);
    assert_eq!(*inner_status.borrow(), Some(Status::Done));
}

#[test]
fn reset_retargets_the_timer() {
    let queue = queue();
    let events = Rc::new(RefCell::new(Vec::new()));

    let recorded = events.clone();
    let timer = queue
        .schedule_timer(
            TimerInfo::once(Duration::from_secs(60)),
            move |_, value, status| {
                recorded.borrow_mut().push((value, status, false));
            },
        )
        .unwrap();

    let q = queue.clone();
    let recorded = events.clone();
    let status = timer.reset(
        TimerInfo::once(Duration::from_millis(10)),
        Some(move |_: &evio_driver::Handle, value: u32, status: Status| {
            recorded.borrow_mut().push((value, status, true));
            if status == Status::Done {
                q.wakeup(WakeupFlags::GRACEFUL);
            }
        }),
    );
    assert_eq!(status, Status::Ok);

    assert_eq!(queue.run(None, QueueWakeupInfo::default()), Status::Ok);

    let events = events.borrow();
    // Only the replacement completion observed anything.
    assert!(events.iter().all(|(_, _, replaced)| *replaced));
    assert_eq!(events.last().map(|(v, st, _)| (*v, *st)), Some((1, Status::Done)));
}
