//! Per-worker session pool.
//!
//! Each worker owns one slot. A slot's session is opened on the first
//! `acquire` from that worker and reused until it is invalidated or the pool
//! is torn down. Teardown runs once: explicitly through `release_all`, or on
//! drop, so a panicking worker still gets its session closed.

use super::provider::DataError;
use super::session::{QuoteSession, SessionFactory};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

type Slot = Option<Box<dyn QuoteSession>>;

/// Counts from a pool teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Sessions opened over the pool's lifetime.
    pub opened: usize,
    /// Sessions closed cleanly, including ones invalidated mid-run.
    pub closed: usize,
    /// Sessions whose close returned an error.
    pub failed: usize,
}

impl TeardownReport {
    pub fn all_closed(&self) -> bool {
        self.failed == 0 && self.opened == self.closed
    }
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    slots: Vec<Mutex<Slot>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    failed: AtomicUsize,
    released: AtomicBool,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, workers: usize) -> Self {
        Self {
            factory,
            slots: (0..workers.max(1)).map(|_| Mutex::new(None)).collect(),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn width(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, worker: usize) -> Result<MutexGuard<'_, Slot>, DataError> {
        let slot = self.slots.get(worker).ok_or_else(|| {
            DataError::Other(format!(
                "worker {worker} outside pool of {}",
                self.slots.len()
            ))
        })?;
        // A worker that panicked mid-call leaves a usable slot behind.
        Ok(slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// The worker's session, opened on first use.
    pub fn acquire(&self, worker: usize) -> Result<SessionLease<'_>, DataError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(DataError::SessionClosed);
        }
        let mut guard = self.slot(worker)?;

        if guard.as_ref().is_some_and(|s| s.is_closed()) {
            guard.take();
        }
        if guard.is_none() {
            let session = self.factory.connect(worker)?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            debug!(worker, "session opened");
            *guard = Some(session);
        }

        Ok(SessionLease {
            pool: self,
            worker,
            guard,
        })
    }

    /// Close and forget the worker's session; the next acquire reconnects.
    pub fn invalidate(&self, worker: usize) {
        match self.slot(worker) {
            Ok(mut guard) => self.close_slot(worker, &mut guard),
            Err(e) => warn!(worker, error = %e, "invalidate on unknown worker"),
        }
    }

    fn close_slot(&self, worker: usize, slot: &mut Slot) {
        let Some(mut session) = slot.take() else {
            return;
        };
        match session.close() {
            Ok(()) => {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!(worker, error = %e, "session close failed");
            }
        }
    }

    /// Close every tracked session. Only the first call does any work.
    pub fn release_all(&self) -> TeardownReport {
        if self.released.swap(true, Ordering::SeqCst) {
            return self.report();
        }
        for worker in 0..self.slots.len() {
            if let Ok(mut guard) = self.slot(worker) {
                self.close_slot(worker, &mut guard);
            }
        }
        let report = self.report();
        debug!(
            opened = report.opened,
            closed = report.closed,
            failed = report.failed,
            "session pool released"
        );
        report
    }

    pub fn report(&self) -> TeardownReport {
        TeardownReport {
            opened: self.opened.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Exclusive access to one worker's session.
pub struct SessionLease<'a> {
    pool: &'a SessionPool,
    worker: usize,
    guard: MutexGuard<'a, Slot>,
}

impl SessionLease<'_> {
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Close the session after it returned a protocol error.
    pub fn invalidate(mut self) {
        self.pool.close_slot(self.worker, &mut self.guard);
    }
}

impl Deref for SessionLease<'_> {
    type Target = dyn QuoteSession;

    fn deref(&self) -> &Self::Target {
        match self.guard.as_deref() {
            Some(session) => session,
            None => unreachable!("lease always holds a session"),
        }
    }
}

impl DerefMut for SessionLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.guard.as_deref_mut() {
            Some(session) => session,
            None => unreachable!("lease always holds a session"),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::data::provider::{DateRange, RawBar};
    use crate::data::wire::SecurityEntry;
    use crate::domain::Exchange;

    /// Session that answers nothing and tracks open/close in shared counters.
    pub struct CountingSession {
        pub closes: Arc<AtomicUsize>,
        pub fail_close: bool,
        pub closed: bool,
    }

    impl QuoteSession for CountingSession {
        fn daily_bars(&mut self, _: Exchange, _: &str, _: DateRange) -> Result<Vec<RawBar>, DataError> {
            Ok(Vec::new())
        }

        fn security_list(&mut self, _: Exchange) -> Result<Vec<SecurityEntry>, DataError> {
            Ok(Vec::new())
        }

        fn heartbeat(&mut self) -> Result<(), DataError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), DataError> {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(DataError::NetworkUnreachable("close failed".into()))
            } else {
                Ok(())
            }
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    #[derive(Default)]
    pub struct CountingFactory {
        pub opens: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub fail_close_on_worker: Option<usize>,
    }

    impl SessionFactory for CountingFactory {
        fn connect(&self, worker: usize) -> Result<Box<dyn QuoteSession>, DataError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession {
                closes: Arc::clone(&self.closes),
                fail_close: self.fail_close_on_worker == Some(worker),
                closed: false,
            }))
        }
    }
}
