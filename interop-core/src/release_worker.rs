//! Dedicated threads that run release callbacks off the calling thread.
//!
//! Every task gets a fresh thread that exits after running it. At most `max`
//! such threads are alive at once; extra tasks queue and are handed to a new
//! thread as soon as one finishes.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

type Spawner = Arc<dyn Fn(thread::Builder, Task) -> io::Result<()> + Send + Sync>;

#[derive(Default)]
struct State {
    active: usize,
    queue: VecDeque<Task>,
}

struct Shared {
    name: String,
    max: usize,
    spawner: Spawner,
    state: Mutex<State>,
    idle: Condvar,
    spawned: AtomicUsize,
}

#[derive(Clone)]
pub struct ReleaseWorkers {
    shared: Arc<Shared>,
}

impl ReleaseWorkers {
    pub fn new(max: usize, name: impl Into<String>) -> Self {
        let spawner: Spawner =
            Arc::new(|builder: thread::Builder, body: Task| builder.spawn(body).map(drop));
        Self::with_spawner(max, name, spawner)
    }

    fn with_spawner(max: usize, name: impl Into<String>, spawner: Spawner) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                max: max.max(1),
                spawner,
                state: Mutex::new(State::default()),
                idle: Condvar::new(),
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    pub fn submit(&self, task: Task) {
        let mut state = self.shared.state.lock();
        if state.active >= self.shared.max {
            state.queue.push_back(task);
            return;
        }
        state.active += 1;
        drop(state);
        self.shared.spawn(task);
    }

    /// Blocks until no task is running or queued.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.active > 0 || !state.queue.is_empty() {
            self.shared.idle.wait(&mut state);
        }
    }

    pub fn active(&self) -> usize {
        self.shared.state.lock().active
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Threads started so far.
    pub fn spawned(&self) -> usize {
        self.shared.spawned.load(Ordering::SeqCst)
    }
}

fn run(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!("release task panicked");
    }
}

impl Shared {
    /// Runs `task` on a fresh thread. When no thread can be started the task
    /// runs inline, and so do queued tasks until one gets a thread.
    fn spawn(self: &Arc<Self>, mut task: Task) {
        while let Some(unstarted) = self.try_spawn(task) {
            run(unstarted);
            match self.next_or_retire() {
                Some(next) => task = next,
                None => return,
            }
        }
    }

    /// Hands `task` to a new thread, or gives it back if spawning failed.
    fn try_spawn(self: &Arc<Self>, task: Task) -> Option<Task> {
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(Mutex::new(Some(task)));
        let in_thread = slot.clone();
        let shared = self.clone();
        let body: Task = Box::new(move || {
            if let Some(task) = in_thread.lock().take() {
                run(task);
            }
            if let Some(next) = shared.next_or_retire() {
                shared.spawn(next);
            }
        });
        let builder = thread::Builder::new().name(format!("{}-{n}", self.name));
        match (self.spawner)(builder, body) {
            Ok(()) => {
                debug!(worker = n, "release thread started");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn release thread; releasing inline");
                slot.lock().take()
            }
        }
    }

    /// The next queued task for a finishing slot, or frees the slot.
    fn next_or_retire(&self) -> Option<Task> {
        let mut state = self.state.lock();
        let next = state.queue.pop_front();
        if next.is_none() {
            state.active -= 1;
            if state.active == 0 {
                self.idle.notify_all();
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_off_the_calling_thread() {
        let workers = ReleaseWorkers::new(2, "test-release");
        let (tx, rx) = mpsc::channel();
        workers.submit(Box::new(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send((thread::current().id(), name)).unwrap();
        }));
        let (id, name) = rx.recv().unwrap();
        assert_ne!(id, thread::current().id());
        assert_eq!(name.as_deref(), Some("test-release-0"));
        workers.wait_idle();
        assert_eq!(workers.active(), 0);
    }

    #[test]
    fn bounded_concurrency_with_one_thread_per_task() {
        let workers = ReleaseWorkers::new(2, "bounded");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            workers.submit(Box::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        workers.wait_idle();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(workers.spawned(), 8);
        assert_eq!(workers.queued(), 0);
    }

    #[test]
    fn spawn_failures_drain_the_queue_inline() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        // Only the first spawn gets a thread.
        let spawner: Spawner = Arc::new(move |builder: thread::Builder, body: Task| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                builder.spawn(body).map(drop)
            } else {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no threads left"))
            }
        });
        let workers = ReleaseWorkers::with_spawner(1, "starved", spawner);

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        workers.submit(Box::new(move || gate_rx.recv().unwrap()));
        let ran = Arc::new(AtomicUsize::new(0));
        let queued = 100_000;
        for _ in 0..queued {
            let ran = ran.clone();
            workers.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(workers.queued(), queued);

        gate_tx.send(()).unwrap();
        workers.wait_idle();
        assert_eq!(ran.load(Ordering::SeqCst), queued);
        assert_eq!(workers.active(), 0);
        assert_eq!(started.load(Ordering::SeqCst), queued + 1);
    }

    #[test]
    fn panicking_task_does_not_wedge_pool() {
        let workers = ReleaseWorkers::new(1, "panicky");
        workers.submit(Box::new(|| panic!("release failed")));
        let (tx, rx) = mpsc::channel();
        workers.submit(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        workers.wait_idle();
    }
}
