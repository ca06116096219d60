//! Concurrency gate for outbound operations.
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use snafu::Snafu;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// A permit could not be acquired within the configured maximum wait.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(display("bulkhead '{name}' saturated: no permit available within {max_wait:?}"))]
pub struct AdmissionRejected {
    /// Name of the bulkhead that rejected the caller.
    pub name: String,

    /// Maximum wait that elapsed, or `None` if the wait was unbounded.
    pub max_wait: Option<Duration>,
}

/// Point-in-time view of a bulkhead's occupancy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BulkheadStats {
    /// Permits free for immediate acquisition.
    pub available_permits: usize,

    /// Permits currently held.
    pub in_flight_calls: usize,

    /// Callers currently waiting for a permit.
    pub queued_calls: usize,

    /// Total number of permits.
    pub max_permits: usize,
}

struct Inner {
    name: String,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    max_wait: Option<Duration>,
    waiting: AtomicUsize,
}

/// A bulkhead.
///
/// Bounds the number of concurrently running operations to a fixed capacity. Callers acquire a [`BulkheadPermit`]
/// before starting an operation and hold it until the operation completes, at which point dropping the permit returns
/// it to the pool.
///
/// When no permit is free, callers wait up to the configured maximum wait before being rejected with
/// [`AdmissionRejected`]. Waiters are granted permits in the order they arrived.
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<Inner>,
}

impl Bulkhead {
    /// Creates a new `Bulkhead` with the given capacity and maximum wait.
    ///
    /// A maximum wait of `None` waits indefinitely for a permit, while a maximum wait of zero rejects immediately if no
    /// permit is free.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds [`Semaphore::MAX_PERMITS`].
    pub fn new<S: Into<String>>(name: S, capacity: usize, max_wait: Option<Duration>) -> Self {
        assert!(capacity > 0, "bulkhead capacity must be non-zero");
        assert!(
            capacity <= Semaphore::MAX_PERMITS,
            "bulkhead capacity must not exceed {}",
            Semaphore::MAX_PERMITS
        );

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                max_wait,
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the name of this bulkhead.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the total number of permits.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns the maximum time a caller may wait for a permit.
    pub fn max_wait(&self) -> Option<Duration> {
        self.inner.max_wait
    }

    /// Acquires a permit, waiting up to the configured maximum wait.
    ///
    /// # Errors
    ///
    /// If no permit became available within the maximum wait, an error is returned.
    pub async fn acquire(&self) -> Result<BulkheadPermit, AdmissionRejected> {
        self.acquire_within(self.inner.max_wait).await
    }

    /// Acquires a permit without waiting.
    ///
    /// # Errors
    ///
    /// If no permit is free right now, an error is returned.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, AdmissionRejected> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.granted(permit)),
            Err(_) => Err(self.rejected(Some(Duration::ZERO))),
        }
    }

    /// Acquires a permit, waiting up to `max_wait` rather than the configured maximum wait.
    ///
    /// # Errors
    ///
    /// If no permit became available within `max_wait`, an error is returned.
    pub async fn acquire_within(&self, max_wait: Option<Duration>) -> Result<BulkheadPermit, AdmissionRejected> {
        // Fast path. Released permits are handed to queued waiters before they become available here, so this never
        // jumps ahead of anyone already waiting.
        if let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            return Ok(self.granted(permit));
        }

        if max_wait == Some(Duration::ZERO) {
            return Err(self.rejected(max_wait));
        }

        let _waiting = WaitingGuard::enter(&self.inner.waiting);
        let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();
        let maybe_permit = match max_wait {
            Some(max_wait) => tokio::time::timeout(max_wait, acquire).await.ok().and_then(Result::ok),
            None => acquire.await.ok(),
        };

        match maybe_permit {
            Some(permit) => Ok(self.granted(permit)),
            None => Err(self.rejected(max_wait)),
        }
    }

    /// Returns the current occupancy of this bulkhead.
    pub fn stats(&self) -> BulkheadStats {
        let available_permits = self.inner.semaphore.available_permits();
        BulkheadStats {
            available_permits,
            in_flight_calls: self.inner.capacity.saturating_sub(available_permits),
            queued_calls: self.inner.waiting.load(Relaxed),
            max_permits: self.inner.capacity,
        }
    }

    fn granted(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        trace!(bulkhead = %self.inner.name, "Permit acquired.");
        BulkheadPermit { _permit: permit }
    }

    fn rejected(&self, max_wait: Option<Duration>) -> AdmissionRejected {
        trace!(bulkhead = %self.inner.name, ?max_wait, "Permit acquisition rejected.");
        AdmissionRejected {
            name: self.inner.name.clone(),
            max_wait,
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("max_wait", &self.inner.max_wait)
            .finish()
    }
}

/// A bulkhead permit.
///
/// The permit is returned to its bulkhead when dropped, which happens exactly once regardless of how the guarded
/// operation exits.
#[must_use = "dropping a permit immediately returns it to the bulkhead"]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    /// Returns the permit to its bulkhead.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BulkheadPermit")
    }
}

struct WaitingGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> WaitingGuard<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Relaxed);
        Self { waiting }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Relaxed);
    }
}
