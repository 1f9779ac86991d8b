use std::{thread::JoinHandle, time::Duration};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use evio_driver::Status;

type BoxClosure = Box<dyn FnOnce() + Send>;

fn worker(receiver: Receiver<BoxClosure>, recv_limit: Duration) -> impl FnOnce() {
    move || {
        while let Ok(f) = receiver.recv_timeout(recv_limit) {
            f();
        }
    }
}

/// A grow-on-demand worker pool for offloaded CPU work.
///
/// Dispatch hands the task to an idle worker through a rendezvous channel;
/// when every worker is busy a new thread is spawned, up to `limit`.
/// Workers exit after `recv_limit` without work.
pub struct DispatchPool {
    sender: Sender<BoxClosure>,
    receiver: Receiver<BoxClosure>,
    threads: Vec<JoinHandle<()>>,
    name: String,
    limit: usize,
    recv_limit: Duration,
}

impl DispatchPool {
    /// Create a pool. No threads are spawned until the first dispatch.
    pub fn new(name: impl Into<String>, limit: usize, recv_limit: Duration) -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender,
            receiver,
            threads: Vec::new(),
            name: name.into(),
            limit: limit.max(1),
            recv_limit,
        }
    }

    fn spawn(&mut self) -> Status {
        let worker = worker(self.receiver.clone(), self.recv_limit);
        let builder =
            std::thread::Builder::new().name(format!("{}:{}", self.name, self.threads.len()));
        match builder.spawn(worker) {
            Ok(thread) => {
                self.threads.push(thread);
                Status::Ok
            }
            Err(err) => Status::from(err),
        }
    }

    /// Run `f` on a worker thread.
    pub fn dispatch(&mut self, f: impl FnOnce() + Send + 'static) -> Status {
        self.threads.retain(|t| !t.is_finished());
        if self.threads.is_empty() {
            let status = self.spawn();
            if status != Status::Ok {
                return status;
            }
        }
        match self.sender.try_send(Box::new(f) as BoxClosure) {
            Ok(()) => Status::Ok,
            Err(TrySendError::Full(f)) => {
                if self.threads.len() < self.limit {
                    let status = self.spawn();
                    if status != Status::Ok {
                        return status;
                    }
                }
                // Blocks until a worker frees up when the pool is at its
                // limit.
                match self.sender.send(f) {
                    Ok(()) => Status::Ok,
                    Err(_) => Status::ErrorUnknown,
                }
            }
            Err(TrySendError::Disconnected(_)) => Status::ErrorUnknown,
        }
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// Stop accepting work and join every worker.
    pub fn cancel(mut self) {
        drop(self.sender);
        drop(self.receiver);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::DispatchPool;

    #[test]
    fn dispatch_runs_everything() {
        let mut pool = DispatchPool::new("test", 4, Duration::from_secs(5));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = counter.clone();
            pool.dispatch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn growth_is_bounded() {
        let mut pool = DispatchPool::new("bounded", 2, Duration::from_secs(5));
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        for _ in 0..8 {
            let tx = tx.clone();
            pool.dispatch(move || {
                tx.send(()).ok();
                std::thread::sleep(Duration::from_millis(10));
            });
            assert!(pool.workers() <= 2);
        }
        drop(tx);
        while rx.recv().is_ok() {}
        pool.cancel();
    }
}
