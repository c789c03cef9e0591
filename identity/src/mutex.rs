//! Serialization of authentication-state operations.
//!
//! The [`AuthOperationMutex`] guarantees that at most one operation runs per
//! lock slot at a time. Contenders queue FIFO behind the holder, and every
//! operation carries a deadline covering both waiting and running.
//!
//! Slots are named by a key. The metadata synchronizer keys by user id, so
//! operations for different users never wait on each other; passing the same
//! key everywhere gives a single process-wide lock.
//!
//! # Guarantees
//!
//! - A queued operation whose deadline passes is removed from the queue and
//!   never starts late. Operations queued behind it are unaffected.
//! - A running operation that overruns its deadline loses the lock and its
//!   caller receives [`IdentityError::MutexTimeout`]. The work itself is not
//!   interrupted: it is moved to a background task and may still complete,
//!   so it must be safe to finish without holding the lock.
//! - A queued operation whose caller goes away leaves the queue at once.
//! - The lock is released on every exit path of the work: success, error,
//!   panic, and cancellation of the calling future.
//! - State changes are broadcast as [`MutexEvent`]s. Each subscriber owns its
//!   receiver, so a slow or dropped subscriber cannot stall the mutex or any
//!   other subscriber.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{IdentityError, Result};

/// Deadline applied by [`AuthOperationMutex::run`].
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered state-change events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;

/// The tracked kinds of authentication operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Reading claims for a session.
    Extraction,
    /// Writing role or permission state.
    Refresh,
    /// Drift validation and self-healing.
    Validation,
    /// Read-only permission lookups.
    PermissionCheck,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Extraction => "extraction",
            OperationKind::Refresh => "refresh",
            OperationKind::Validation => "validation",
            OperationKind::PermissionCheck => "permission_check",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of a guarded operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOperation {
    pub id: String,
    pub kind: OperationKind,
    /// The lock slot this operation contends for.
    pub key: String,
    pub enqueued_at: DateTime<Utc>,
}

impl AuthOperation {
    /// A new operation with a fresh ULID.
    pub fn new(key: impl Into<String>, kind: OperationKind) -> Self {
        Self::with_id(ulid::Ulid::new().to_string(), key, kind)
    }

    pub fn with_id(id: impl Into<String>, key: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            key: key.into(),
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutexEventKind {
    Queued,
    Acquired,
    Released,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    ForceReleased,
}

/// A state-change notification.
#[derive(Debug, Clone, Serialize)]
pub struct MutexEvent {
    pub kind: MutexEventKind,
    pub operation: AuthOperation,
    /// Queue length of the operation's slot right after the change.
    pub queue_len: usize,
    pub at: DateTime<Utc>,
}

/// Observable state of one lock slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Locked {
        current: AuthOperation,
        queued: usize,
    },
}

impl SlotStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, SlotStatus::Idle)
    }
}

enum Grant {
    Granted,
    Cancelled,
}

struct Waiter {
    operation: AuthOperation,
    grant: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct Slot {
    current: Option<AuthOperation>,
    queue: VecDeque<Waiter>,
}

#[derive(Default)]
struct MutexState {
    slots: HashMap<String, Slot>,
    last_operation_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: Mutex<MutexState>,
    events: broadcast::Sender<MutexEvent>,
    default_timeout: Duration,
}

/// Keyed FIFO mutex for authentication operations.
///
/// Cloning is cheap and every clone shares the same lock state. Construct one
/// per process (or per test) and hand it to every component that needs it.
#[derive(Clone)]
pub struct AuthOperationMutex {
    inner: Arc<Inner>,
}

impl AuthOperationMutex {
    pub fn new() -> Self {
        Self::with_default_timeout(DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn with_default_timeout(default_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MutexState::default()),
                events,
                default_timeout,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<MutexEvent> {
        self.inner.events.subscribe()
    }

    /// Run `work` under a fresh operation on slot `key` with the default
    /// timeout.
    pub async fn run<T, F, Fut>(&self, key: &str, kind: OperationKind, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.inner.default_timeout;
        self.acquire(AuthOperation::new(key, kind), timeout, work)
            .await
    }

    /// Run `work` once `operation` holds its slot.
    ///
    /// `timeout` is measured from the call and covers both queueing and
    /// running. The work's own error is returned unchanged. Work still running
    /// at the deadline keeps running on a background task after the lock is
    /// released.
    pub async fn acquire<T, F, Fut>(
        &self,
        operation: AuthOperation,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + timeout;

        // Events are sent under the state lock so subscribers observe them
        // in the same order as the state changes.
        let waiting = {
            let mut state = self.inner.state.lock();
            let slot = state.slots.entry(operation.key.clone()).or_default();
            if slot.current.is_none() {
                slot.current = Some(operation.clone());
                state.last_operation_at = Some(Utc::now());
                self.emit(MutexEventKind::Acquired, &operation, 0);
                None
            } else {
                let (grant, granted) = oneshot::channel();
                slot.queue.push_back(Waiter {
                    operation: operation.clone(),
                    grant,
                });
                let queue_len = slot.queue.len();
                self.emit(MutexEventKind::Queued, &operation, queue_len);
                Some((granted, queue_len))
            }
        };

        match waiting {
            None => {
                debug!(
                    "Auth operation {} ({}) acquired slot '{}'",
                    operation.id, operation.kind, operation.key
                );
            }
            Some((granted, queue_len)) => {
                debug!(
                    "Auth operation {} ({}) queued on slot '{}' at position {}",
                    operation.id, operation.kind, operation.key, queue_len
                );

                let mut queued = QueuedWaiter {
                    mutex: self,
                    key: operation.key.clone(),
                    operation_id: operation.id.clone(),
                    armed: true,
                };
                let outcome = tokio::time::timeout_at(deadline, granted).await;
                queued.armed = false;
                drop(queued);

                match outcome {
                    Ok(Ok(Grant::Granted)) => {}
                    Ok(Ok(Grant::Cancelled)) | Ok(Err(_)) => {
                        self.emit(MutexEventKind::Cancelled, &operation, 0);
                        return Err(IdentityError::MutexCancelled {
                            operation_id: operation.id,
                        });
                    }
                    Err(_) => {
                        if self.abandon_waiter(&operation.key, &operation.id) {
                            // Granted in the same instant the deadline passed.
                            self.release_inner(&operation.key, &operation.id);
                        }
                        warn!(
                            "Auth operation {} ({}) timed out while queued on slot '{}'",
                            operation.id, operation.kind, operation.key
                        );
                        self.emit(MutexEventKind::TimedOut, &operation, 0);
                        return Err(timeout_error(operation, timeout));
                    }
                }
            }
        }

        let held = HeldLock {
            mutex: self,
            key: &operation.key,
            operation_id: &operation.id,
        };
        let mut work = Box::pin(work());
        let outcome = tokio::select! {
            result = &mut work => Some(result),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        let result = match outcome {
            Some(Ok(value)) => {
                self.emit(MutexEventKind::Completed, &operation, 0);
                Ok(value)
            }
            Some(Err(e)) => {
                debug!("Auth operation {} failed: {}", operation.id, e);
                self.emit(MutexEventKind::Failed, &operation, 0);
                Err(e)
            }
            None => {
                warn!(
                    "Auth operation {} ({}) exceeded {:?} while running on slot '{}'",
                    operation.id, operation.kind, timeout, operation.key
                );
                self.emit(MutexEventKind::TimedOut, &operation, 0);
                let operation_id = operation.id.clone();
                tokio::spawn(async move {
                    match work.await {
                        Ok(_) => debug!(
                            "Timed out auth operation {} finished in the background",
                            operation_id
                        ),
                        Err(e) => debug!(
                            "Timed out auth operation {} failed in the background: {}",
                            operation_id, e
                        ),
                    }
                });
                Err(timeout_error(operation.clone(), timeout))
            }
        };
        drop(held);
        result
    }

    /// Release slot `key` if `operation_id` is its current holder.
    ///
    /// A mismatched release is a no-op that logs a warning and returns false.
    pub fn release(&self, key: &str, operation_id: &str) -> bool {
        let released = self.release_inner(key, operation_id);
        if !released {
            warn!(
                "Mutex contention: release of slot '{}' by non-holder {} ignored",
                key, operation_id
            );
        }
        released
    }

    /// Whether an operation of `kind` is running or queued on any slot.
    pub fn has_operation_type(&self, kind: OperationKind) -> bool {
        let state = self.inner.state.lock();
        state.slots.values().any(|slot| slot_has_kind(slot, kind))
    }

    /// Whether an operation of `kind` is running or queued on slot `key`.
    pub fn has_operation_for(&self, key: &str, kind: OperationKind) -> bool {
        let state = self.inner.state.lock();
        state
            .slots
            .get(key)
            .is_some_and(|slot| slot_has_kind(slot, kind))
    }

    pub fn status(&self, key: &str) -> SlotStatus {
        let state = self.inner.state.lock();
        match state.slots.get(key) {
            Some(Slot {
                current: Some(current),
                queue,
            }) => SlotStatus::Locked {
                current: current.clone(),
                queued: queue.len(),
            },
            _ => SlotStatus::Idle,
        }
    }

    /// Whether no slot is held.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.slots.values().all(|slot| slot.current.is_none())
    }

    pub fn last_operation_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_operation_at
    }

    /// Emergency reset: fail every queued operation with
    /// [`IdentityError::MutexCancelled`] and clear all slots.
    ///
    /// Work that is already running is not interrupted; its eventual release
    /// becomes a no-op. Returns the number of queued operations cancelled.
    pub fn force_release_all(&self) -> usize {
        let slots = {
            let mut state = self.inner.state.lock();
            state.last_operation_at = Some(Utc::now());
            std::mem::take(&mut state.slots)
        };

        let mut cancelled = 0;
        for (_, slot) in slots {
            if let Some(current) = slot.current {
                self.emit(MutexEventKind::ForceReleased, &current, 0);
            }
            for waiter in slot.queue {
                // The waiter may have given up already; nothing to do then.
                let _ = waiter.grant.send(Grant::Cancelled);
                cancelled += 1;
            }
        }

        warn!(
            "Force released all auth operation slots, {} queued operation(s) cancelled",
            cancelled
        );
        cancelled
    }

    /// Hand the slot to the next live waiter, or free it.
    fn release_inner(&self, key: &str, operation_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            return false;
        };
        if !slot
            .current
            .as_ref()
            .is_some_and(|current| current.id == operation_id)
        {
            return false;
        }
        let Some(finished) = slot.current.take() else {
            return false;
        };
        debug!("Auth operation {} released slot '{}'", finished.id, key);
        self.emit(MutexEventKind::Released, &finished, slot.queue.len());

        while let Some(waiter) = slot.queue.pop_front() {
            slot.current = Some(waiter.operation.clone());
            if waiter.grant.send(Grant::Granted).is_ok() {
                debug!("Auth operation {} acquired slot '{}'", waiter.operation.id, key);
                self.emit(MutexEventKind::Acquired, &waiter.operation, slot.queue.len());
                break;
            }
            debug!("Skipping abandoned waiter {}", waiter.operation.id);
            slot.current = None;
        }

        if slot.current.is_none() && slot.queue.is_empty() {
            state.slots.remove(key);
        }
        state.last_operation_at = Some(Utc::now());
        true
    }

    /// Remove a timed-out waiter from its queue. Returns true if the waiter
    /// is not queued because it was granted the slot and now holds it.
    fn abandon_waiter(&self, key: &str, operation_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            return false;
        };
        if let Some(position) = slot
            .queue
            .iter()
            .position(|waiter| waiter.operation.id == operation_id)
        {
            slot.queue.remove(position);
            return false;
        }
        slot.current
            .as_ref()
            .is_some_and(|current| current.id == operation_id)
    }

    fn emit(&self, kind: MutexEventKind, operation: &AuthOperation, queue_len: usize) {
        // Sending only fails when nobody is subscribed.
        let _ = self.inner.events.send(MutexEvent {
            kind,
            operation: operation.clone(),
            queue_len,
            at: Utc::now(),
        });
    }
}

impl Default for AuthOperationMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthOperationMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AuthOperationMutex")
            .field("held_slots", &state.slots.len())
            .field("default_timeout", &self.inner.default_timeout)
            .field("subscribers", &self.inner.events.receiver_count())
            .finish()
    }
}

/// Releases the slot when dropped, whichever way the work exits.
struct HeldLock<'a> {
    mutex: &'a AuthOperationMutex,
    key: &'a str,
    operation_id: &'a str,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if !self.mutex.release_inner(self.key, self.operation_id) {
            debug!(
                "Slot '{}' was no longer held by {} (force released)",
                self.key, self.operation_id
            );
        }
    }
}

/// Takes a queued operation out of its slot if the caller stops waiting.
struct QueuedWaiter<'a> {
    mutex: &'a AuthOperationMutex,
    key: String,
    operation_id: String,
    armed: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(
            "Queued auth operation {} was dropped before acquiring slot '{}'",
            self.operation_id, self.key
        );
        if self.mutex.abandon_waiter(&self.key, &self.operation_id) {
            self.mutex.release_inner(&self.key, &self.operation_id);
        }
    }
}

fn slot_has_kind(slot: &Slot, kind: OperationKind) -> bool {
    slot.current.as_ref().is_some_and(|op| op.kind == kind)
        || slot.queue.iter().any(|waiter| waiter.operation.kind == kind)
}

fn timeout_error(operation: AuthOperation, timeout: Duration) -> IdentityError {
    IdentityError::MutexTimeout {
        operation_id: operation.id,
        kind: operation.kind,
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    async fn wait_for(
        events: &mut broadcast::Receiver<MutexEvent>,
        kind: MutexEventKind,
        operation_id: &str,
    ) -> MutexEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind == kind && event.operation.id == operation_id {
                return event;
            }
        }
    }

    /// Spawn an operation on `key` that holds the slot until `gate` fires.
    async fn hold(
        mutex: &AuthOperationMutex,
        events: &mut broadcast::Receiver<MutexEvent>,
        key: &str,
        kind: OperationKind,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let (open, gate) = oneshot::channel::<()>();
        let op = AuthOperation::new(key, kind);
        let id = op.id.clone();
        let m = mutex.clone();
        let handle = tokio::spawn(async move {
            m.acquire(op, Duration::from_secs(60), || async move {
                let _ = gate.await;
                Ok(())
            })
            .await
        });
        wait_for(events, MutexEventKind::Acquired, &id).await;
        (open, handle)
    }

    #[tokio::test]
    async fn test_uncontended_acquire_runs_immediately() {
        let mutex = AuthOperationMutex::new();
        let value = mutex
            .run("user_1", OperationKind::Refresh, || async { Ok(41 + 1) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(mutex.status("user_1").is_idle());
        assert!(mutex.last_operation_at().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        const N: usize = 24;
        let mutex = AuthOperationMutex::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..N {
            let m = mutex.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let completed = completed.clone();
            handles.push(tokio::spawn(async move {
                m.run("shared", OperationKind::Refresh, || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), N);
        assert!(mutex.is_idle());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let mutex = AuthOperationMutex::new();
        let mut events = mutex.subscribe();
        let (open, holder) = hold(&mutex, &mut events, "k", OperationKind::Refresh).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for name in ["A", "B", "C"] {
            let op = AuthOperation::new("k", OperationKind::Refresh);
            let id = op.id.clone();
            let m = mutex.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                m.acquire(op, Duration::from_secs(60), || async move {
                    order.lock().push(name);
                    Ok(())
                })
                .await
            }));
            wait_for(&mut events, MutexEventKind::Queued, &id).await;
        }

        assert!(matches!(
            mutex.status("k"),
            SlotStatus::Locked { queued: 3, .. }
        ));

        open.send(()).unwrap();
        holder.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_timeout_is_isolated() {
        let mutex = AuthOperationMutex::new();
        let m = mutex.clone();
        let holder = tokio::spawn(async move {
            m.run("k", OperationKind::Refresh, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;

        let ran = Arc::new(AtomicBool::new(false));
        let m = mutex.clone();
        let flag = ran.clone();
        let impatient = tokio::spawn(async move {
            let op = AuthOperation::new("k", OperationKind::Validation);
            m.acquire(op, Duration::from_secs(1), || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;

        let m = mutex.clone();
        let patient = tokio::spawn(async move {
            let op = AuthOperation::new("k", OperationKind::Refresh);
            m.acquire(op, Duration::from_secs(60), || async { Ok("done") })
                .await
        });

        let err = impatient.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            IdentityError::MutexTimeout {
                kind: OperationKind::Validation,
                ..
            }
        ));
        assert!(!mutex.has_operation_type(OperationKind::Validation));

        holder.await.unwrap().unwrap();
        assert_eq!(patient.await.unwrap().unwrap(), "done");
        assert!(!ran.load(Ordering::SeqCst));
        assert!(mutex.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_timeout_releases_lock() {
        let mutex = AuthOperationMutex::new();
        let mut events = mutex.subscribe();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let op = AuthOperation::new("k", OperationKind::Refresh);
        let id = op.id.clone();
        let err = mutex
            .acquire(op, Duration::from_secs(1), || async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IdentityError::MutexTimeout { .. }));
        let timed_out = wait_for(&mut events, MutexEventKind::TimedOut, &id).await;
        assert_eq!(timed_out.operation.kind, OperationKind::Refresh);
        wait_for(&mut events, MutexEventKind::Released, &id).await;
        assert!(mutex.status("k").is_idle());
        assert!(!finished.load(Ordering::SeqCst));

        mutex
            .run("k", OperationKind::Refresh, || async { Ok(()) })
            .await
            .unwrap();

        // The overrunning work was not interrupted.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let mutex = AuthOperationMutex::new();
        let mut events = mutex.subscribe();
        let (open, holder) = hold(&mutex, &mut events, "user_1", OperationKind::Refresh).await;

        let op = AuthOperation::new("user_1", OperationKind::Validation);
        let id = op.id.clone();
        let m = mutex.clone();
        let waiter = tokio::spawn(async move {
            m.acquire(op, Duration::from_secs(60), || async { Ok(()) })
                .await
        });
        wait_for(&mut events, MutexEventKind::Queued, &id).await;
        assert!(mutex.has_operation_for("user_1", OperationKind::Validation));

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(!mutex.has_operation_for("user_1", OperationKind::Validation));
        assert!(matches!(
            mutex.status("user_1"),
            SlotStatus::Locked { queued: 0, .. }
        ));

        open.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert!(mutex.is_idle());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_does_not_affect_mutex() {
        let mutex = AuthOperationMutex::new();
        let mut lagging = mutex.subscribe();

        for _ in 0..EVENT_CAPACITY {
            mutex
                .run("k", OperationKind::PermissionCheck, || async { Ok(()) })
                .await
                .unwrap();
        }
        assert!(mutex.is_idle());
        assert!(matches!(
            lagging.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        // The lagging receiver keeps working from the oldest retained event.
        let op = AuthOperation::new("k", OperationKind::Refresh);
        let id = op.id.clone();
        mutex
            .acquire(op, Duration::from_secs(1), || async { Ok(()) })
            .await
            .unwrap();
        wait_for(&mut lagging, MutexEventKind::Completed, &id).await;
    }

    #[tokio::test]
    async fn test_work_error_releases_and_propagates() {
        let mutex = AuthOperationMutex::new();
        let err = mutex
            .run("k", OperationKind::Refresh, || async {
                Err::<(), _>(IdentityError::NoExistingPermissions("user_1".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IdentityError::NoExistingPermissions(ref u) if u == "user_1"));
        assert!(mutex.status("k").is_idle());
    }

    #[tokio::test]
    async fn test_panicking_work_releases_lock() {
        let mutex = AuthOperationMutex::new();
        let m = mutex.clone();
        let result = tokio::spawn(async move {
            m.run("k", OperationKind::Refresh, || async {
                if true {
                    panic!("work blew up");
                }
                Ok(())
            })
            .await
        })
        .await;

        assert!(result.is_err());
        assert!(mutex.status("k").is_idle());
    }

    #[tokio::test]
    async fn test_mismatched_release_is_noop() {
        let mutex = AuthOperationMutex::new();
        let mut events = mutex.subscribe();
        let (open, holder) = hold(&mutex, &mut events, "k", OperationKind::Refresh).await;

        assert!(!mutex.release("k", "not-the-holder"));
        assert!(!mutex.release("other-slot", "not-the-holder"));
        assert!(!mutex.status("k").is_idle());

        open.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert!(mutex.status("k").is_idle());
    }

    #[tokio::test]
    async fn test_force_release_cancels_queue() {
        let mutex = AuthOperationMutex::new();
        let mut events = mutex.subscribe();
        let (open, holder) = hold(&mutex, &mut events, "k", OperationKind::Refresh).await;

        let mut queued = Vec::new();
        for _ in 0..3 {
            let op = AuthOperation::new("k", OperationKind::Refresh);
            let id = op.id.clone();
            let m = mutex.clone();
            queued.push(tokio::spawn(async move {
                m.acquire(op, Duration::from_secs(60), || async { Ok(()) })
                    .await
            }));
            wait_for(&mut events, MutexEventKind::Queued, &id).await;
        }

        assert_eq!(mutex.force_release_all(), 3);
        for handle in queued {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, IdentityError::MutexCancelled { .. }));
        }
        assert!(mutex.status("k").is_idle());
        assert!(mutex.is_idle());

        // The interrupted holder still finishes; its late release is ignored.
        open.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert!(mutex.is_idle());
    }

    #[tokio::test]
    async fn test_has_operation_type() {
        let mutex = AuthOperationMutex::new();
        let mut events = mutex.subscribe();
        let (open, holder) = hold(&mutex, &mut events, "user_1", OperationKind::Refresh).await;

        let op = AuthOperation::new("user_1", OperationKind::Validation);
        let id = op.id.clone();
        let m = mutex.clone();
        let validation = tokio::spawn(async move {
            m.acquire(op, Duration::from_secs(60), || async { Ok(()) })
                .await
        });
        wait_for(&mut events, MutexEventKind::Queued, &id).await;

        assert!(mutex.has_operation_type(OperationKind::Refresh));
        assert!(mutex.has_operation_type(OperationKind::Validation));
        assert!(!mutex.has_operation_type(OperationKind::Extraction));
        assert!(mutex.has_operation_for("user_1", OperationKind::Validation));
        assert!(!mutex.has_operation_for("user_2", OperationKind::Validation));

        open.send(()).unwrap();
        holder.await.unwrap().unwrap();
        validation.await.unwrap().unwrap();
        assert!(!mutex.has_operation_type(OperationKind::Refresh));
        assert!(!mutex.has_operation_type(OperationKind::Validation));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let mutex = AuthOperationMutex::new();
        let mut events = mutex.subscribe();
        let (open, holder) = hold(&mutex, &mut events, "user_1", OperationKind::Refresh).await;

        let op = AuthOperation::new("user_2", OperationKind::Refresh);
        mutex
            .acquire(op, Duration::from_millis(100), || async { Ok(()) })
            .await
            .unwrap();

        open.send(()).unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_affect_mutex() {
        let mutex = AuthOperationMutex::new();
        let dropped = mutex.subscribe();
        let mut live = mutex.subscribe();
        drop(dropped);

        let op = AuthOperation::new("k", OperationKind::PermissionCheck);
        let id = op.id.clone();
        mutex
            .acquire(op, Duration::from_secs(1), || async { Ok(()) })
            .await
            .unwrap();

        let acquired = wait_for(&mut live, MutexEventKind::Acquired, &id).await;
        assert_eq!(acquired.operation.kind, OperationKind::PermissionCheck);
        wait_for(&mut live, MutexEventKind::Completed, &id).await;
        wait_for(&mut live, MutexEventKind::Released, &id).await;
    }
}
