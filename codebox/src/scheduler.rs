//! Worker pool
//!
//! Bounds the number of isolates running at once across all conversations.
//! Waiters are served in FIFO order (tokio's semaphore is fair). The pool is
//! built once at service start, injected into the engine and shut down
//! explicitly.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub running: usize,
    pub queued: usize,
}

#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    running: Arc<watch::Sender<usize>>,
    queued: Arc<AtomicUsize>,
}

/// Held for the duration of one isolate run.
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
    running: Arc<watch::Sender<usize>>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct QueuedGuard(Arc<AtomicUsize>);

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (running, _) = watch::channel(0usize);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            running: Arc::new(running),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free slot. Fails once the pool has been shut down.
    pub async fn acquire(&self) -> EngineResult<PoolSlot> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let guard = QueuedGuard(Arc::clone(&self.queued));
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::PoolClosed)?;
        drop(guard);
        self.running.send_modify(|n| *n += 1);
        Ok(PoolSlot {
            _permit: permit,
            running: Arc::clone(&self.running),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            available: self.semaphore.available_permits(),
            running: *self.running.borrow(),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Refuse new work, fail queued waiters and wait for running isolates to finish.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;
        tracing::info!("Worker pool shut down");
    }
}
