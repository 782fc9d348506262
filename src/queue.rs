//! Hunt queue.
//!
//! Holds approved hypotheses until the executor takes them. FIFO by
//! enqueue timestamp by default; uniform random dequeue only when the
//! caller explicitly asks for it. There is no priority: every pending
//! hypothesis is equal. Enqueue is rate-limited per rolling hour.
//!
//! One `Mutex` guards the whole queue. Nothing is held across calls; the
//! executor only ever receives an owned `Hypothesis`.

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::types::{GridLimits, Hypothesis, HuntError};

/// How the next hypothesis is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DequeueMode {
    /// Oldest entry by enqueue timestamp.
    #[default]
    Fifo,
    /// Uniform sample over pending entries. Opt-in; counters the pull to
    /// keep working the oldest, most invested-in question.
    Random,
}

/// Result of a well-formed, approved enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnqueueStatus {
    Queued {
        hypothesis_id: String,
        pending: usize,
    },
    /// Nothing was queued. Retry once the rolling window frees a slot.
    RateLimit {
        limit: usize,
        retry_after: DateTime<Utc>,
    },
}

/// One pending hypothesis. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    hypothesis: Hypothesis,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

impl QueueEntry {
    pub fn hypothesis(&self) -> &Hypothesis {
        &self.hypothesis
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

/// Non-removing view of a pending entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub hypothesis_id: String,
    pub question: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<QueueEntry>,
    /// Timestamps of accepted enqueues inside the rolling hour.
    window: VecDeque<DateTime<Utc>>,
    /// Every id ever accepted; hypotheses are single-use.
    seen_ids: HashSet<String>,
    next_seq: u64,
}

pub struct HuntQueue {
    inner: Mutex<QueueInner>,
    max_per_hour: usize,
    limits: GridLimits,
}

impl HuntQueue {
    pub fn new(config: &QueueConfig, limits: GridLimits) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_per_hour: config.max_enqueues_per_hour,
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // The inner state stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue an approved hypothesis now.
    pub fn enqueue(&self, hypothesis: Hypothesis) -> Result<EnqueueStatus, HuntError> {
        self.enqueue_at(hypothesis, Utc::now())
    }

    /// Enqueue with an explicit timestamp.
    ///
    /// Fails with `Approval` for unapproved hypotheses and `Validation` for
    /// over-cap grids or an id that was already submitted. A full rolling
    /// window is not an error: it returns `RateLimit` and queues nothing.
    pub fn enqueue_at(
        &self,
        hypothesis: Hypothesis,
        now: DateTime<Utc>,
    ) -> Result<EnqueueStatus, HuntError> {
        if !hypothesis.is_approved() {
            warn!(hypothesis_id = %hypothesis.id(), "Enqueue refused: not approved");
            return Err(HuntError::Approval(format!(
                "hypothesis {} has no human approval",
                hypothesis.id()
            )));
        }
        hypothesis.check_limits(&self.limits)?;

        let mut inner = self.lock();

        if inner.seen_ids.contains(hypothesis.id()) {
            return Err(HuntError::validation(
                "id",
                format!(
                    "hypothesis {} was already submitted; re-runs need a new hypothesis",
                    hypothesis.id()
                ),
            ));
        }

        let window_start = now - Duration::hours(1);
        while inner.window.front().is_some_and(|t| *t <= window_start) {
            inner.window.pop_front();
        }
        if inner.window.len() >= self.max_per_hour {
            let oldest = inner.window.front().copied().unwrap_or(now);
            let retry_after = oldest + Duration::hours(1);
            warn!(
                hypothesis_id = %hypothesis.id(),
                limit = self.max_per_hour,
                retry_after = %retry_after,
                "Enqueue rate limit reached"
            );
            return Ok(EnqueueStatus::RateLimit {
                limit: self.max_per_hour,
                retry_after,
            });
        }

        let hypothesis_id = hypothesis.id().to_string();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.window.push_back(now);
        inner.seen_ids.insert(hypothesis_id.clone());
        inner.entries.push_back(QueueEntry {
            hypothesis,
            enqueued_at: now,
            seq,
        });
        let pending = inner.entries.len();

        info!(hypothesis_id = %hypothesis_id, pending, "Hypothesis enqueued");
        Ok(EnqueueStatus::Queued {
            hypothesis_id,
            pending,
        })
    }

    /// Take the next hypothesis. `Random` uses the thread-local RNG.
    pub fn dequeue(&self, mode: DequeueMode) -> Option<Hypothesis> {
        match mode {
            DequeueMode::Fifo => self.dequeue_fifo(),
            DequeueMode::Random => self.dequeue_random_with(&mut rand::thread_rng()),
        }
    }

    /// Uniform random dequeue with a caller-supplied RNG (seedable in tests).
    pub fn dequeue_random_with<R: Rng>(&self, rng: &mut R) -> Option<Hypothesis> {
        let mut inner = self.lock();
        if inner.entries.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..inner.entries.len());
        let entry = inner.entries.remove(idx)?;
        debug!(
            hypothesis_id = %entry.hypothesis.id(),
            remaining = inner.entries.len(),
            mode = "RANDOM",
            "Hypothesis dequeued"
        );
        Some(entry.hypothesis)
    }

    fn dequeue_fifo(&self) -> Option<Hypothesis> {
        let mut inner = self.lock();
        let idx = inner
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.enqueued_at, e.seq))
            .map(|(i, _)| i)?;
        let entry = inner.entries.remove(idx)?;
        debug!(
            hypothesis_id = %entry.hypothesis.id(),
            remaining = inner.entries.len(),
            mode = "FIFO",
            "Hypothesis dequeued"
        );
        Some(entry.hypothesis)
    }

    /// Snapshot of pending entries in FIFO order, or shuffled on request.
    pub fn peek(&self, shuffle: bool) -> Vec<QueueSnapshot> {
        let mut entries: Vec<QueueEntry> = self.lock().entries.iter().cloned().collect();
        entries.sort_by_key(|e| (e.enqueued_at, e.seq));
        let mut snapshot: Vec<QueueSnapshot> = entries
            .into_iter()
            .map(|e| QueueSnapshot {
                hypothesis_id: e.hypothesis.id().to_string(),
                question: e.hypothesis.question().to_string(),
                enqueued_at: e.enqueued_at,
            })
            .collect();
        if shuffle {
            snapshot.shuffle(&mut rand::thread_rng());
        }
        snapshot
    }

    /// Explicitly withdraw a pending hypothesis.
    pub fn remove(&self, hypothesis_id: &str) -> Option<Hypothesis> {
        let mut inner = self.lock();
        let idx = inner
            .entries
            .iter()
            .position(|e| e.hypothesis.id() == hypothesis_id)?;
        let entry = inner.entries.remove(idx)?;
        info!(hypothesis_id, "Hypothesis removed from queue");
        Some(entry.hypothesis)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
