//! Outbound request bookkeeping.
//!
//! Every request the daemon sends (to a worker, the upstream, or a
//! subscriber) parks a continuation here keyed by its sequence id.  A reply
//! completes it exactly once; unknown sequence ids are dropped at WARN; a
//! sweeper completes overdue entries with `Timeout`; a dying connection
//! completes everything scoped to it with `PeerGone`.  After all
//! connections close the table is empty -- leaked callbacks are a bug.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::warn;
use tv_core::StreamId;
use tv_proto::{ErrorKind, RpcError, SeqId};

/// Which connection an outbound request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingScope {
    Upstream,
    Worker(StreamId),
    Subscriber(u64),
}

/// Default deadline for worker-facing requests.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for upstream-facing requests.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

pub type PendingResult = Result<String, RpcError>;

struct Pending {
    scope: PendingScope,
    deadline: Instant,
    tx: oneshot::Sender<PendingResult>,
}

/// `seq -> (deadline, continuation)`, single process, no cross-process
/// sharing.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<SeqId, Pending>>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable::default()
    }

    /// Park a continuation; the returned receiver completes with the reply,
    /// a synthetic `Timeout`, or `PeerGone`.
    pub fn register(
        &self,
        seq: SeqId,
        scope: PendingScope,
        ttl: Duration,
    ) -> oneshot::Receiver<PendingResult> {
        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            scope,
            deadline: Instant::now() + ttl,
            tx,
        };
        self.inner
            .lock()
            .expect("pending table poisoned")
            .insert(seq, pending);
        rx
    }

    /// Complete by sequence id.  Replies with no parked continuation are
    /// dropped.
    pub fn complete(&self, seq: &str, result: PendingResult) -> bool {
        let entry = self
            .inner
            .lock()
            .expect("pending table poisoned")
            .remove(seq);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(result);
                true
            }
            None => {
                warn!(seq, "reply for unknown sequence id dropped");
                false
            }
        }
    }

    /// Complete every overdue entry with `Timeout`.  Returns how many
    /// expired.
    pub fn expire_due(&self, now: Instant) -> usize {
        let mut table = self.inner.lock().expect("pending table poisoned");
        let due: Vec<SeqId> = table
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| seq.clone())
            .collect();
        for seq in &due {
            if let Some(pending) = table.remove(seq) {
                let _ = pending
                    .tx
                    .send(Err(RpcError::new(ErrorKind::Timeout, "request timed out")));
            }
        }
        due.len()
    }

    /// Complete every entry scoped to a gone peer with `PeerGone`.
    pub fn cancel_scope(&self, scope: &PendingScope) -> usize {
        let mut table = self.inner.lock().expect("pending table poisoned");
        let doomed: Vec<SeqId> = table
            .iter()
            .filter(|(_, p)| p.scope == *scope)
            .map(|(seq, _)| seq.clone())
            .collect();
        for seq in &doomed {
            if let Some(pending) = table.remove(seq) {
                let _ = pending
                    .tx
                    .send(Err(RpcError::new(ErrorKind::PeerGone, "peer disconnected")));
            }
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
