//! Bounded background extraction of artifacts likely to be needed next.
//!
//! A fixed set of tokio workers pulls requests from a shared priority queue
//! (highest priority first, FIFO among equals) and runs the extraction on
//! the blocking pool. Each request publishes its outcome on a `watch`
//! channel so that any number of callers can wait for one commit without
//! blocking on the others.
//!
//! Priority upgrades push a fresh heap entry; stale entries are skipped when
//! popped rather than removed eagerly.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::CommitId;
use crate::obs;
use crate::store::{ArtifactStore, StoreError};

/// Priority used by [`PrefetchPool::await_commit`] for unscheduled commits.
pub const TOP_PRIORITY: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrefetchError {
    #[error("commit not cached: {0}")]
    NotCached(CommitId),

    #[error("extraction of {commit} failed: {reason}")]
    Extraction { commit: CommitId, reason: String },

    #[error("prefetch of {0} was cancelled")]
    Cancelled(CommitId),

    #[error("prefetch pool is shut down")]
    Shutdown,
}

/// Produces a runnable directory for a cached commit.
pub trait Extractor: Send + Sync + 'static {
    fn extract(&self, commit: &CommitId) -> Result<PathBuf, StoreError>;
}

impl Extractor for ArtifactStore {
    fn extract(&self, commit: &CommitId) -> Result<PathBuf, StoreError> {
        self.extract_working_copy(commit)
    }
}

type Outcome = Result<PathBuf, PrefetchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued { priority: u32, seq: u64 },
    Running,
    Done,
}

struct Request {
    slot: Slot,
    tx: watch::Sender<Option<Outcome>>,
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: u32,
    seq: u64,
    commit: CommitId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<QueueEntry>,
    requests: HashMap<CommitId, Request>,
    next_seq: u64,
    shutdown: bool,
}

impl State {
    /// Enqueue or upgrade; returns a receiver for the request's outcome and
    /// whether a worker needs waking.
    fn enqueue(&mut self, commit: &CommitId, priority: u32) -> (watch::Receiver<Option<Outcome>>, bool) {
        if let Some(req) = self.requests.get_mut(commit) {
            match req.slot {
                Slot::Done => {
                    let stale = matches!(&*req.tx.borrow(), Some(Ok(path)) if !path.is_dir());
                    if !stale {
                        return (req.tx.subscribe(), false);
                    }
                    // Working copy evicted since; extract again.
                    req.tx.send_replace(None);
                }
                Slot::Running => return (req.tx.subscribe(), false),
                Slot::Queued { priority: current, seq } => {
                    if priority > current {
                        req.slot = Slot::Queued { priority, seq };
                        self.heap.push(QueueEntry {
                            priority,
                            seq,
                            commit: commit.clone(),
                        });
                    }
                    return (req.tx.subscribe(), false);
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let rx = match self.requests.get_mut(commit) {
            Some(req) => {
                req.slot = Slot::Queued { priority, seq };
                req.tx.subscribe()
            }
            None => {
                let (tx, rx) = watch::channel(None);
                self.requests.insert(
                    commit.clone(),
                    Request {
                        slot: Slot::Queued { priority, seq },
                        tx,
                    },
                );
                rx
            }
        };
        self.heap.push(QueueEntry {
            priority,
            seq,
            commit: commit.clone(),
        });
        (rx, true)
    }

    fn pop_next(&mut self) -> Option<CommitId> {
        while let Some(entry) = self.heap.pop() {
            let Some(req) = self.requests.get_mut(&entry.commit) else {
                continue;
            };
            if req.slot
                == (Slot::Queued {
                    priority: entry.priority,
                    seq: entry.seq,
                })
            {
                req.slot = Slot::Running;
                return Some(entry.commit);
            }
        }
        None
    }

    fn is_queued(&self, commit: &CommitId) -> bool {
        matches!(
            self.requests.get(commit).map(|r| r.slot),
            Some(Slot::Queued { .. })
        )
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    extractor: Arc<dyn Extractor>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed-width pool of extraction workers.
pub struct PrefetchPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PrefetchPool {
    /// Spawn `width` workers on the current tokio runtime.
    pub fn new(extractor: Arc<dyn Extractor>, width: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            extractor,
        });
        let workers = (0..width.max(1))
            .map(|worker| tokio::spawn(worker_loop(Arc::clone(&shared), worker)))
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Request extraction of `commit`. Never blocks; duplicate requests
    /// collapse and a higher priority upgrades a queued one.
    pub fn schedule(&self, commit: &CommitId, priority: u32) -> Result<(), PrefetchError> {
        let wake = {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(PrefetchError::Shutdown);
            }
            state.enqueue(commit, priority).1
        };
        if wake {
            self.shared.notify.notify_one();
        }
        Ok(())
    }

    /// Wait for `commit`'s extraction, scheduling it at top priority if it
    /// is not already queued, running or done.
    pub async fn await_commit(&self, commit: &CommitId) -> Outcome {
        let (mut rx, wake) = {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(PrefetchError::Shutdown);
            }
            state.enqueue(commit, TOP_PRIORITY)
        };
        if wake {
            self.shared.notify.notify_one();
        }
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return match rx.borrow().clone() {
                    Some(outcome) => outcome,
                    None => Err(PrefetchError::Cancelled(commit.clone())),
                };
            }
        }
    }

    /// Drop a queued request. In-flight extractions run to completion.
    pub fn cancel(&self, commit: &CommitId) -> bool {
        let mut state = self.shared.lock();
        if state.is_queued(commit) {
            state.requests.remove(commit);
            true
        } else {
            false
        }
    }

    /// Drop every queued request not in `keep`. Returns how many were dropped.
    pub fn retain(&self, keep: &HashSet<CommitId>) -> usize {
        let mut state = self.shared.lock();
        let doomed: Vec<CommitId> = state
            .requests
            .iter()
            .filter(|(c, r)| matches!(r.slot, Slot::Queued { .. }) && !keep.contains(*c))
            .map(|(c, _)| c.clone())
            .collect();
        for commit in &doomed {
            state.requests.remove(commit);
        }
        if !doomed.is_empty() {
            debug!(dropped = doomed.len(), "cancelled stale prefetch requests");
        }
        doomed.len()
    }

    pub fn is_pending(&self, commit: &CommitId) -> bool {
        matches!(
            self.shared.lock().requests.get(commit).map(|r| r.slot),
            Some(Slot::Queued { .. } | Slot::Running)
        )
    }

    /// Stop accepting work, drop queued requests and wait for in-flight
    /// extractions to finish.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.heap.clear();
            state
                .requests
                .retain(|_, r| !matches!(r.slot, Slot::Queued { .. }));
        }
        self.shared.notify.notify_waiters();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl Drop for PrefetchPool {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.notify.notify_waiters();
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = {
            let mut state = shared.lock();
            if state.shutdown {
                None
            } else {
                state.pop_next()
            }
        };
        match next {
            Some(commit) => run_one(&shared, worker, commit).await,
            None if shared.lock().shutdown => return,
            None => notified.await,
        }
    }
}

async fn run_one(shared: &Arc<Shared>, worker: usize, commit: CommitId) {
    debug!(worker, commit = %commit.short(), "prefetch started");
    let started = Instant::now();
    let extractor = Arc::clone(&shared.extractor);
    let target = commit.clone();
    let outcome = match tokio::task::spawn_blocking(move || extractor.extract(&target)).await {
        Ok(Ok(path)) => Ok(path),
        Ok(Err(StoreError::NotCached(c))) => Err(PrefetchError::NotCached(c)),
        Ok(Err(e)) => Err(PrefetchError::Extraction {
            commit: commit.clone(),
            reason: e.to_string(),
        }),
        Err(e) => Err(PrefetchError::Extraction {
            commit: commit.clone(),
            reason: format!("extraction task failed: {e}"),
        }),
    };
    obs::emit_extraction_finished(
        &commit,
        started.elapsed().as_millis() as u64,
        outcome.is_ok(),
    );

    let mut state = shared.lock();
    let failed = outcome.is_err();
    if let Some(req) = state.requests.get_mut(&commit) {
        req.tx.send_replace(Some(outcome));
        req.slot = Slot::Done;
    }
    if failed {
        // Waiters already hold the error; a later request retries.
        state.requests.remove(&commit);
    }
}
