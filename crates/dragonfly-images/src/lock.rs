//! Single-flight import lock
//!
//! At most one holder at a time. Callers that find the lock held are told
//! so through [`Flight::AlreadyRunning`] and are expected to skip, not wait.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::debug;

/// Name of the process-wide boot image import lock
pub const BOOT_IMAGES_LOCK: &str = "boot_images";

/// A non-blocking mutual exclusion gate
///
/// Implemented by [`ImportLock`]; tests substitute their own gates to force
/// contention deterministically.
pub trait ImportGate: Send + Sync {
    /// Identity of the gate, used in logs
    fn name(&self) -> &str;

    /// Whether the gate is currently held. Never blocks, never mutates.
    fn locked(&self) -> bool;

    /// Take the gate if it is free
    fn try_acquire(&self) -> Option<LockPermit>;
}

/// Proof of holding an [`ImportLock`]; releases it on drop
#[must_use = "the lock is released as soon as the permit is dropped"]
pub struct LockPermit {
    name: Arc<str>,
    held: Arc<AtomicBool>,
}

impl LockPermit {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockPermit {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
        debug!(lock = %self.name, "Lock released");
    }
}

impl std::fmt::Debug for LockPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockPermit").field("name", &self.name).finish()
    }
}

/// Process-wide single-flight lock backed by an atomic flag
#[derive(Debug, Clone)]
pub struct ImportLock {
    name: Arc<str>,
    held: Arc<AtomicBool>,
}

impl ImportLock {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The lock guarding boot image imports
    pub fn boot_images() -> Self {
        Self::new(BOOT_IMAGES_LOCK)
    }
}

impl ImportGate for ImportLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn locked(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<LockPermit> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        debug!(lock = %self.name, "Lock acquired");
        Some(LockPermit {
            name: self.name.clone(),
            held: self.held.clone(),
        })
    }
}

/// Outcome of [`run`]
#[must_use]
#[derive(Debug)]
pub enum Flight<T> {
    /// The operation was scheduled and holds the lock until it finishes
    Started(JoinHandle<T>),
    /// Someone else holds the lock; nothing was scheduled
    AlreadyRunning,
}

impl<T> Flight<T> {
    pub fn is_started(&self) -> bool {
        matches!(self, Flight::Started(_))
    }
}

/// Run `operation` on the tokio runtime while holding `gate`
///
/// Acquiring the gate and spawning the task happen together: of any number
/// of concurrent callers, exactly one gets [`Flight::Started`]. The gate is
/// released when the operation finishes, however it finishes, and before its
/// output is visible through the join handle.
///
/// Must be called from within a tokio runtime.
pub fn run<G, F, Fut>(gate: &G, operation: F) -> Flight<Fut::Output>
where
    G: ImportGate + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let Some(permit) = gate.try_acquire() else {
        debug!(lock = %gate.name(), "Lock held, not starting");
        return Flight::AlreadyRunning;
    };

    let future = operation();
    Flight::Started(tokio::spawn(async move {
        let output = future.await;
        debug!(lock = %permit.name(), "Operation finished");
        drop(permit);
        output
    }))
}
