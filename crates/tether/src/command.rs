use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_queue::SegQueue;
use tether_utils::{fatal, spawn_named};

use crate::event_loop::LoopCore;

/// How many commands one execute round dequeues at a time.
const EXECUTE_BULK: usize = 128;

/// A unit of work posted to a [`CommandQueue`]. Runs to completion on
/// whichever thread consumes the queue.
pub enum Command {
    /// Self-contained work; runs on any consumer.
    Call(Box<dyn FnOnce() + Send>),
    /// Work that needs the owning event loop's internals (host registry,
    /// poll). Only a loop may consume these.
    OnLoop(Box<dyn FnOnce(&mut LoopCore) + Send>),
    /// A parked continuation plus whatever it keeps alive.
    Resume(Continuation),
}

impl Command {
    pub fn call(f: impl FnOnce() + Send + 'static) -> Self {
        Command::Call(Box::new(f))
    }

    pub(crate) fn on_loop(f: impl FnOnce(&mut LoopCore) + Send + 'static) -> Self {
        Command::OnLoop(Box::new(f))
    }
}

/// Suspended work handed over to another queue. The holder pins any object
/// graph the continuation needs until it has run.
pub struct Continuation {
    holder: Option<Arc<dyn std::any::Any + Send + Sync>>,
    resume: Box<dyn FnOnce() + Send>,
}

impl Continuation {
    pub fn new(
        holder: Option<Arc<dyn std::any::Any + Send + Sync>>,
        resume: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { holder, resume: Box::new(resume) }
    }

    fn run(self) {
        (self.resume)();
        drop(self.holder);
    }
}

const WORKER_RUNNING: u32 = 1;
const WORKER_STOP: u32 = 2;

struct QueueInner {
    queue: SegQueue<Command>,
    worker_flags: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Multi-producer single-consumer command queue.
///
/// Producers on any thread enqueue; one consumer drains, either an event
/// loop or the queue's own worker thread started with [`run_async`].
/// Per-producer FIFO order is preserved; nothing is promised across
/// producers.
///
/// [`run_async`]: CommandQueue::run_async
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: SegQueue::new(),
                worker_flags: AtomicU32::new(0),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Thread-safe, non-blocking.
    #[inline]
    pub fn enqueue(&self, command: Command) {
        self.inner.queue.push(command);
    }

    #[inline]
    pub fn enqueue_call(&self, f: impl FnOnce() + Send + 'static) {
        self.enqueue(Command::call(f));
    }

    /// Parks `resume` on this queue, keeping `holder` alive until the
    /// consumer runs it. The non-coroutine form of transferring a suspended
    /// computation onto another executor.
    pub fn schedule(
        &self,
        holder: Option<Arc<dyn std::any::Any + Send + Sync>>,
        resume: impl FnOnce() + Send + 'static,
    ) {
        self.enqueue(Command::Resume(Continuation::new(holder, resume)));
    }

    #[inline]
    pub fn has_any(&self) -> bool {
        !self.inner.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Consumer-only bulk dequeue; returns how many commands were moved
    /// into `out`.
    pub fn try_dequeue_bulk(&self, out: &mut Vec<Command>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.inner.queue.pop() {
                Some(cmd) => {
                    out.push(cmd);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Runs up to `max` commands on the calling thread. `OnLoop` commands
    /// cannot run here and are dropped as a programming error.
    pub fn execute(&self, max: usize) -> usize {
        run_batches(&self.inner, max, |cmd| match cmd {
            Command::Call(f) => f(),
            Command::Resume(c) => c.run(),
            Command::OnLoop(_) => {
                fatal!("OnLoop command executed outside its event loop, dropping");
            }
        })
    }

    /// Runs up to `max` commands with the event loop context available.
    pub(crate) fn execute_on_loop(&self, core: &mut LoopCore, max: usize) -> usize {
        run_batches(&self.inner, max, |cmd| match cmd {
            Command::Call(f) => f(),
            Command::Resume(c) => c.run(),
            Command::OnLoop(f) => f(&mut *core),
        })
    }

    /// Spawns an owned worker thread draining this queue. When idle it
    /// sleeps `idle_sleep`, doubling up to `max_sleep` until work shows up.
    pub fn run_async(&self, idle_sleep: Duration, max_sleep: Duration) {
        if self.inner.worker_flags.fetch_or(WORKER_RUNNING, Ordering::AcqRel) & WORKER_RUNNING != 0
        {
            fatal!("command queue worker already running");
            return;
        }
        let inner = self.inner.clone();
        let queue = self.clone();
        let handle = spawn_named("tether-queue", move || {
            let mut sleep = idle_sleep;
            while inner.worker_flags.load(Ordering::Acquire) & WORKER_STOP == 0 {
                let executed = queue.execute(EXECUTE_BULK);
                if executed == 0 {
                    std::thread::sleep(sleep);
                    sleep = (sleep * 2).min(max_sleep);
                } else {
                    sleep = idle_sleep;
                }
            }
            // Drain whatever raced with the stop request.
            while queue.execute(EXECUTE_BULK) != 0 {}
        });
        *self.inner.worker.lock().expect("queue worker lock poisoned") = Some(handle);
    }

    pub fn queue_stop(&self) {
        self.inner.worker_flags.fetch_or(WORKER_STOP, Ordering::AcqRel);
    }

    /// Stops the worker and joins it. No-op when none is running.
    pub fn wait_stop(&self) {
        self.queue_stop();
        let handle = self.inner.worker.lock().expect("queue worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.worker_flags.store(0, Ordering::Release);
    }

    pub fn is_running_async(&self) -> bool {
        self.inner.worker_flags.load(Ordering::Acquire) & WORKER_RUNNING != 0
    }
}

fn run_batches(inner: &QueueInner, max: usize, mut run: impl FnMut(Command)) -> usize {
    let mut executed = 0;
    let mut batch = Vec::with_capacity(EXECUTE_BULK);
    while executed < max {
        let want = EXECUTE_BULK.min(max - executed);
        for _ in 0..want {
            match inner.queue.pop() {
                Some(cmd) => batch.push(cmd),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }
        executed += batch.len();
        for cmd in batch.drain(..) {
            run(cmd);
        }
    }
    executed
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_in_fifo_order_per_producer() {
        let q = CommandQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            q.enqueue_call(move || seen.lock().unwrap().push(i));
        }
        assert_eq!(q.execute(usize::MAX), 10);
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(!q.has_any());
    }

    #[test]
    fn execute_respects_max() {
        let q = CommandQueue::new();
        let n = Arc::new(AtomicUsize::new(0));
        for _ in 0..300 {
            let n = n.clone();
            q.enqueue_call(move || {
                n.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(q.execute(200), 200);
        assert_eq!(n.load(Ordering::Relaxed), 200);
        assert_eq!(q.execute(usize::MAX), 100);
    }

    #[test]
    fn bulk_dequeue_hands_off_ownership() {
        let q = CommandQueue::new();
        for _ in 0..5 {
            q.enqueue_call(|| {});
        }
        let mut out = Vec::new();
        assert_eq!(q.try_dequeue_bulk(&mut out, 3), 3);
        assert_eq!(q.try_dequeue_bulk(&mut out, 10), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn scheduled_continuation_keeps_holder_alive() {
        let q = CommandQueue::new();
        let holder: Arc<dyn std::any::Any + Send + Sync> = Arc::new(42u64);
        let weak = Arc::downgrade(&holder);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        q.schedule(Some(holder), move || {
            ran2.fetch_add(1, Ordering::Relaxed);
        });
        assert!(weak.upgrade().is_some(), "holder must stay alive while parked");
        q.execute(usize::MAX);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert!(weak.upgrade().is_none(), "holder released after resumption");
    }

    #[test]
    fn worker_drains_and_stops() {
        let q = CommandQueue::new();
        q.run_async(Duration::from_micros(50), Duration::from_millis(5));
        let n = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let n = n.clone();
            q.enqueue_call(move || {
                n.fetch_add(1, Ordering::Relaxed);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while n.load(Ordering::Relaxed) < 100 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(n.load(Ordering::Relaxed), 100);
        q.wait_stop();
        assert!(!q.is_running_async());
    }

    #[test]
    fn stop_drains_pending_commands() {
        let q = CommandQueue::new();
        let n = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let n = n.clone();
            q.enqueue_call(move || {
                n.fetch_add(1, Ordering::Relaxed);
            });
        }
        q.run_async(Duration::from_micros(50), Duration::from_millis(1));
        q.wait_stop();
        assert_eq!(n.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn cross_thread_producers() {
        let q = CommandQueue::new();
        let n = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let n = n.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let n = n.clone();
                    q.enqueue_call(move || {
                        n.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        q.execute(usize::MAX);
        assert_eq!(n.load(Ordering::Relaxed), 4000);
    }
}
