use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use evio_driver::{QueueWakeupInfo, Status, TimerInfo, WakeupFlags};
use evio_runtime::{Looper, LooperInfo};

#[test]
fn acquire_is_a_thread_singleton() {
    let thread = std::thread::spawn(|| {
        let a = Looper::acquire(LooperInfo::default()).unwrap();
        let b = Looper::acquire(LooperInfo::default()).unwrap();
        assert!(a.is_on_thread());
        assert!(b.is_on_thread());
        assert!(Looper::current().is_some());
        Looper::release();
        assert!(Looper::current().is_none());
    });
    thread.join().unwrap();
}

#[test]
fn perform_on_thread_immediate_runs_inline() {
    let thread = std::thread::spawn(|| {
        let looper = Looper::acquire(LooperInfo::default()).unwrap();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        let status = looper.perform_on_thread(
            move || {
                *flag.borrow_mut() = true;
            },
            true,
        );
        assert_eq!(status, Status::Ok);
        assert!(*ran.borrow());
        Looper::release();
    });
    thread.join().unwrap();
}

#[test]
fn cross_thread_perform_and_wakeup() {
    let thread = std::thread::spawn(|| {
        let looper = Looper::acquire(LooperInfo::default()).unwrap();
        let handle = looper.handle();

        let hits = Arc::new(AtomicU32::new(0));
        let producer = {
            let hits = hits.clone();
            let handle = handle.clone();
            std::thread::spawn(move || {
                assert!(!handle.is_on_thread());
                for _ in 0..10 {
                    let hits = hits.clone();
                    handle.perform(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                }
                handle.wakeup(WakeupFlags::GRACEFUL);
            })
        };

        looper.run_default();
        producer.join().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            looper.wait(Some(Duration::from_millis(10)));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        Looper::release();
    });
    thread.join().unwrap();
}

#[test]
fn worker_pool_round_trip() {
    let thread = std::thread::spawn(|| {
        let looper = Looper::acquire(LooperInfo {
            name: "pool-test".into(),
            workers_count: 2,
            ..Default::default()
        })
        .unwrap();

        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        let looper_handle = looper.handle();
        let status = looper.perform_async_with(
            || {
                // Worker-side computation.
                std::hint::black_box(42);
            },
            move || {
                *flag.lock().unwrap() = true;
                looper_handle.wakeup(WakeupFlags::GRACEFUL);
            },
        );
        assert_eq!(status, Status::Ok);

        looper.run_default();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !*done.lock().unwrap() && std::time::Instant::now() < deadline {
            looper.wait(Some(Duration::from_millis(10)));
        }
        assert!(*done.lock().unwrap());
        assert!(looper.workers_count() >= 1);
        Looper::release();
    });
    thread.join().unwrap();
}

#[test]
fn suspend_threads_wakeup_drains_the_pool() {
    let thread = std::thread::spawn(|| {
        let looper = Looper::acquire(LooperInfo::default()).unwrap();

        let handle = looper.handle();
        looper.perform_async(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.wakeup(WakeupFlags::GRACEFUL | WakeupFlags::SUSPEND_THREADS);
        });
        // The wakeup flag is latched looper-side before the queue stops.
        looper.wakeup(WakeupFlags::SUSPEND_THREADS | WakeupFlags::GRACEFUL);

        looper.run(None, QueueWakeupInfo::default());
        assert_eq!(looper.workers_count(), 0);
        Looper::release();
    });
    thread.join().unwrap();
}

#[test]
fn scheduled_timer_on_looper() {
    let thread = std::thread::spawn(|| {
        let looper = Looper::acquire(LooperInfo::default()).unwrap();
        let fired = Rc::new(RefCell::new(0u32));

        let counter = fired.clone();
        let handle = looper.handle();
        looper
            .schedule_timer(
                TimerInfo::repeating(Duration::from_millis(5), 2),
                move |_, _, status| {
                    if status == Status::Ok {
                        *counter.borrow_mut() += 1;
                    }
                    if status == Status::Done {
                        handle.wakeup(WakeupFlags::GRACEFUL);
                    }
                },
            )
            .unwrap();

        assert_eq!(looper.run_default(), Status::Ok);
        assert!(*fired.borrow() >= 1);
        Looper::release();
    });
    thread.join().unwrap();
}
