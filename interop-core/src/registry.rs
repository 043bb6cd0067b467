//! Keeps foreign-owned objects alive until their release runs exactly once.
//!
//! Entries live in a concurrent map keyed by [`Token`]. Removing an entry is
//! what grants the right to run its release, so a release can never run
//! twice even when several threads race for it. The preserved count drops
//! only after the release callback has returned.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use arrow_cdata::Buffer;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{InteropError, Result};
use crate::release_worker::ReleaseWorkers;

type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// How a release request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Parked until the owner thread calls [`PreservationRegistry::empty_pending`].
    Deferred,
    /// Handed to a release worker.
    Dispatched,
}

struct Inner {
    // Mutex only makes the boxed closure Sync; it is never contended.
    entries: DashMap<Token, Mutex<ReleaseFn>>,
    next_token: AtomicU64,
    preserved: AtomicUsize,
    owner: ThreadId,
    pending: Mutex<Vec<Token>>,
    workers: ReleaseWorkers,
    shut_down: AtomicBool,
}

impl Inner {
    fn run(&self, token: Token, release: ReleaseFn) {
        if panic::catch_unwind(AssertUnwindSafe(release)).is_err() {
            warn!(token = token.0, "release callback panicked");
        }
        self.preserved.fetch_sub(1, Ordering::SeqCst);
        debug!(token = token.0, "released");
    }
}

/// Process-wide table of preserved objects. Cloning shares the table.
#[derive(Clone)]
pub struct PreservationRegistry {
    inner: Arc<Inner>,
}

impl PreservationRegistry {
    /// A registry owned by the calling thread.
    pub fn new(release_workers: usize, thread_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                next_token: AtomicU64::new(1),
                preserved: AtomicUsize::new(0),
                owner: thread::current().id(),
                pending: Mutex::new(Vec::new()),
                workers: ReleaseWorkers::new(release_workers, thread_name),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Keeps `object` alive until `release(object)` runs.
    pub fn preserve<T, F>(&self, object: T, release: F) -> Result<Token>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(InteropError::ShutDown);
        }
        let token = Token(self.inner.next_token.fetch_add(1, Ordering::SeqCst));
        self.inner.preserved.fetch_add(1, Ordering::SeqCst);
        self.inner
            .entries
            .insert(token, Mutex::new(Box::new(move || release(object))));
        debug!(token = token.0, "preserved");
        Ok(token)
    }

    /// Keeps `object` alive until released; releasing drops it.
    pub fn preserve_object<T: Send + 'static>(&self, object: T) -> Result<Token> {
        self.preserve(object, drop)
    }

    /// Entries whose release has not finished yet.
    pub fn preserved_count(&self) -> usize {
        self.inner.preserved.load(Ordering::SeqCst)
    }

    pub fn is_preserved(&self, token: Token) -> bool {
        self.inner.entries.contains_key(&token)
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    fn take(&self, token: Token) -> Result<ReleaseFn> {
        self.inner
            .entries
            .remove(&token)
            .map(|(_, release)| release.into_inner())
            .ok_or(InteropError::UnknownToken(token.0))
    }

    /// Runs the release on the calling thread.
    pub fn release(&self, token: Token) -> Result<()> {
        let release = self.take(token)?;
        self.inner.run(token, release);
        Ok(())
    }

    /// Releases inline on the owner thread; parks the request otherwise.
    pub fn release_from_any_thread(&self, token: Token) -> Result<ReleaseOutcome> {
        if self.is_owner_thread() {
            self.release(token)?;
            return Ok(ReleaseOutcome::Released);
        }
        if !self.is_preserved(token) {
            return Err(InteropError::UnknownToken(token.0));
        }
        self.inner.pending.lock().push(token);
        debug!(token = token.0, "release deferred to owner thread");
        Ok(ReleaseOutcome::Deferred)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Runs parked releases on the calling thread; returns how many ran.
    pub fn empty_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        let mut ran = 0;
        for token in pending {
            match self.release(token) {
                Ok(()) => ran += 1,
                Err(e) => debug!(token = token.0, error = %e, "pending release already ran"),
            }
        }
        ran
    }

    /// Runs the release on a dedicated worker thread.
    pub fn release_on_worker(&self, token: Token) -> Result<ReleaseOutcome> {
        let release = self.take(token)?;
        let inner = self.inner.clone();
        self.inner
            .workers
            .submit(Box::new(move || inner.run(token, release)));
        Ok(ReleaseOutcome::Dispatched)
    }

    /// Preserves `object` and returns a guard whose drop releases it on a
    /// worker thread, never on the thread doing the drop.
    pub fn preserve_and_release_on_other_thread<T: Send + 'static>(
        &self,
        object: T,
    ) -> Result<Preserved> {
        let token = self.preserve_object(object)?;
        Ok(Preserved {
            registry: self.clone(),
            token: Some(token),
        })
    }

    /// Exposes the bytes of a preserved object as a buffer.
    ///
    /// The registry entry lives as long as any clone of the buffer; dropping
    /// the last one releases it (deferred when that happens off the owner
    /// thread).
    pub fn preserve_buffer<T>(&self, object: Arc<T>) -> Result<Buffer>
    where
        T: AsRef<[u8]> + Send + Sync + 'static + ?Sized,
    {
        let bytes = (*object).as_ref();
        let (ptr, len) = (bytes.as_ptr(), bytes.len());
        let token = self.preserve_object(object)?;
        let lease = Lease {
            registry: self.clone(),
            token,
        };
        // The bytes sit behind the Arc held by the entry, which outlives the lease.
        Ok(unsafe { Buffer::from_owner(ptr, len, lease) })
    }

    /// Blocks until every dispatched release has finished.
    pub fn wait_for_workers(&self) {
        self.inner.workers.wait_idle();
    }

    pub fn workers(&self) -> &ReleaseWorkers {
        &self.inner.workers
    }

    /// Waits for workers, drains parked releases, then force-releases
    /// whatever is left. Returns the number of leaked entries.
    pub fn shutdown(&self) -> usize {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.wait_for_workers();
        self.empty_pending();
        let leaked: Vec<Token> = self.inner.entries.iter().map(|e| *e.key()).collect();
        for token in &leaked {
            warn!(token = token.0, "entry still preserved at shutdown; releasing");
            if let Err(e) = self.release(*token) {
                debug!(token = token.0, error = %e, "entry released concurrently");
            }
        }
        leaked.len()
    }
}

/// Releases its entry on a worker thread when dropped.
pub struct Preserved {
    registry: PreservationRegistry,
    token: Option<Token>,
}

impl Preserved {
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// Releases on the calling thread instead.
    pub fn release_now(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.registry.release(token),
            None => Ok(()),
        }
    }
}

impl Drop for Preserved {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.registry.release_on_worker(token) {
                warn!(token = token.0, error = %e, "preserved entry vanished before release");
            }
        }
    }
}

struct Lease {
    registry: PreservationRegistry,
    token: Token,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.registry.release_from_any_thread(self.token) {
            warn!(token = self.token.0, error = %e, "buffer lease outlived its entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn registry() -> PreservationRegistry {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        PreservationRegistry::new(2, "test-release")
    }

    #[test]
    fn preserve_and_release_accounting() {
        let reg = registry();
        let tokens: Vec<Token> = (0..5).map(|i| reg.preserve_object(i).unwrap()).collect();
        assert_eq!(reg.preserved_count(), 5);
        for (k, token) in tokens.iter().enumerate() {
            reg.release(*token).unwrap();
            assert_eq!(reg.preserved_count(), 5 - k - 1);
        }
    }

    #[test]
    fn release_runs_exactly_once() {
        let reg = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = reg
            .preserve((), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        reg.release(token).unwrap();
        assert!(matches!(reg.release(token), Err(InteropError::UnknownToken(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_releases_race_safely() {
        let reg = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let tokens: Vec<Token> = (0..64)
            .map(|_| {
                let calls = calls.clone();
                reg.preserve((), move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                let tokens = tokens.clone();
                thread::spawn(move || {
                    for token in tokens {
                        let _ = reg.release(token);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 64);
        assert_eq!(reg.preserved_count(), 0);
    }

    #[test]
    fn foreign_thread_release_is_deferred() {
        let reg = registry();
        let token = reg.preserve_object(String::from("kept")).unwrap();
        let other = reg.clone();
        let outcome = thread::spawn(move || other.release_from_any_thread(token).unwrap())
            .join()
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::Deferred);
        assert_eq!(reg.preserved_count(), 1);
        assert_eq!(reg.pending_count(), 1);
        assert_eq!(reg.empty_pending(), 1);
        assert_eq!(reg.preserved_count(), 0);
        assert_eq!(reg.empty_pending(), 0);
    }

    #[test]
    fn guard_releases_on_worker_thread() {
        let reg = registry();
        let (tx, rx) = mpsc::channel();

        struct ReportOnDrop(mpsc::Sender<thread::ThreadId>);
        impl Drop for ReportOnDrop {
            fn drop(&mut self) {
                let _ = self.0.send(thread::current().id());
            }
        }

        let guard = reg
            .preserve_and_release_on_other_thread(ReportOnDrop(tx))
            .unwrap();
        assert_eq!(reg.preserved_count(), 1);
        drop(guard);
        let released_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(released_on, thread::current().id());
        reg.wait_for_workers();
        assert_eq!(reg.preserved_count(), 0);
    }

    #[test]
    fn buffer_keeps_entry_alive() {
        let reg = registry();
        let bytes: Arc<Vec<u8>> = Arc::new(vec![1, 2, 3]);
        let buffer = reg.preserve_buffer(bytes.clone()).unwrap();
        assert_eq!(buffer.as_slice().unwrap(), &[1, 2, 3]);
        assert_eq!(buffer.as_ptr(), bytes.as_ptr());
        let copy = buffer.clone();
        drop(buffer);
        assert_eq!(reg.preserved_count(), 1);
        drop(copy);
        assert_eq!(reg.preserved_count(), 0);
        assert_eq!(Arc::strong_count(&bytes), 1);
    }

    #[test]
    fn shutdown_force_releases_leaks() {
        let reg = registry();
        reg.preserve_object(1u8).unwrap();
        reg.preserve_object(2u8).unwrap();
        let pending = reg.preserve_object(3u8).unwrap();
        let other = reg.clone();
        thread::spawn(move || other.release_from_any_thread(pending).unwrap())
            .join()
            .unwrap();
        assert_eq!(reg.shutdown(), 2);
        assert_eq!(reg.preserved_count(), 0);
        assert!(matches!(reg.preserve_object(4u8), Err(InteropError::ShutDown)));
    }
}
