//! Keyed async scheduler
//!
//! Operations are partitioned into lanes named by a [`ConcurrencyTag`]. Every
//! lane runs its operations one at a time, in submission order. Two
//! disciplines share the lane table:
//!
//! - [`Coordinator::without_concurrency`]: plain FIFO. Nothing is ever dropped.
//! - [`Coordinator::with_cancellation`]: FIFO as well, but each submission
//!   aborts the [`AbortSignal`] of everything submitted before it on the same
//!   lane. Superseded operations that have not started yet never run; running
//!   ones are expected to poll their signal before committing results.
//!
//! [`Coordinator::settled`] is a barrier that waits for a lane to go idle.
//!
//! Submission is eager: the lane position is taken when the method is called,
//! not when the returned future is first polled. The work itself runs on a
//! spawned tokio task, so dropping a [`Scheduled`] does not cancel it.

use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::trace;

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// Opaque key naming a scheduling lane
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConcurrencyTag {
    id: u64,
    name: &'static str,
}

impl ConcurrencyTag {
    /// Create a new, process-unique tag. `name` is only used for diagnostics.
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ConcurrencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Cooperative cancellation signal handed to `with_cancellation` operations
///
/// The signal is aborted as soon as a newer operation is submitted on the same
/// lane. Nothing is force-terminated: the operation decides where to check.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    generation: u64,
    current: watch::Receiver<u64>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.current.borrow() != self.generation
    }

    /// Resolves once the signal is aborted. Never resolves for an operation
    /// whose lane has been retired without being superseded.
    pub async fn aborted(&self) {
        let generation = self.generation;
        let mut current = self.current.clone();
        if current.wait_for(|g| *g != generation).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle to an operation submitted to the [`Coordinator`]
///
/// Resolves with the operation's own outcome. A panic inside the operation is
/// resumed on the task awaiting this handle.
#[must_use = "the operation runs regardless; await it to observe its outcome"]
pub struct Scheduled<R> {
    handle: JoinHandle<R>,
}

impl<R> Future for Scheduled<R> {
    type Output = R;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(err)) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Poll::Ready(Err(err)) => panic!("scheduled operation torn down with its runtime: {err}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Lane {
    /// Completion of the most recently submitted operation
    tail: Option<oneshot::Receiver<()>>,
    /// Queued + running operations
    pending: watch::Sender<usize>,
    /// Bumped by every `with_cancellation` submission
    generation: watch::Sender<u64>,
}

impl Lane {
    fn new() -> Self {
        Self {
            tail: None,
            pending: watch::Sender::new(0),
            generation: watch::Sender::new(0),
        }
    }
}

type LaneTable = Arc<DashMap<ConcurrencyTag, Lane>>;

/// Position of one operation in its lane
struct Ticket {
    previous: Option<oneshot::Receiver<()>>,
    signal: AbortSignal,
    completion: Completion,
}

/// Releases the lane slot when dropped, including on panic.
struct Completion {
    lanes: LaneTable,
    tag: ConcurrencyTag,
    _done: oneshot::Sender<()>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(lane) = self.lanes.get(&self.tag) {
            lane.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
        // Idle lanes are retired; the next submission starts a fresh one.
        self.lanes
            .remove_if(&self.tag, |_, lane| *lane.pending.borrow() == 0);
    }
}

/// Per-key async scheduler
///
/// Cheap to clone; clones share the same lane table.
#[derive(Clone, Default)]
pub struct Coordinator {
    lanes: LaneTable,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, tag: ConcurrencyTag, supersede: bool) -> Ticket {
        let mut lane = self.lanes.entry(tag).or_insert_with(Lane::new);
        lane.pending.send_modify(|n| *n += 1);
        if supersede {
            lane.generation.send_modify(|g| *g += 1);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let previous = lane.tail.replace(done_rx);
        let signal = AbortSignal {
            generation: *lane.generation.borrow(),
            current: lane.generation.subscribe(),
        };

        trace!(?tag, pending = *lane.pending.borrow(), supersede, "Operation queued");

        Ticket {
            previous,
            signal,
            completion: Completion {
                lanes: Arc::clone(&self.lanes),
                tag,
                _done: done_tx,
            },
        }
    }

    /// Run `op` after every operation previously submitted on `tag`.
    pub fn without_concurrency<F, Fut, R>(&self, tag: ConcurrencyTag, op: F) -> Scheduled<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let Ticket {
            previous,
            completion,
            ..
        } = self.enqueue(tag, false);

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                // Err only means the predecessor is gone, which is what we wait for
                let _ = previous.await;
            }
            let result = op().await;
            drop(completion);
            result
        });

        Scheduled { handle }
    }

    /// Supersede everything submitted on `tag` so far and queue `op` behind it.
    ///
    /// Resolves to `None` when `op` was itself superseded before it could
    /// start, in which case it never ran.
    pub fn with_cancellation<F, Fut, R>(&self, tag: ConcurrencyTag, op: F) -> Scheduled<Option<R>>
    where
        F: FnOnce(AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let Ticket {
            previous,
            signal,
            completion,
        } = self.enqueue(tag, true);

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if signal.is_aborted() {
                trace!(?tag, "Skipping operation superseded before it started");
                drop(completion);
                return None;
            }
            let result = op(signal).await;
            drop(completion);
            Some(result)
        });

        Scheduled { handle }
    }

    /// Resolves once `tag` has no queued or running operation.
    ///
    /// The lane is sampled when this method is called; nothing is enqueued.
    pub fn settled(&self, tag: ConcurrencyTag) -> impl Future<Output = ()> + Send + 'static {
        let pending = self.lanes.get(&tag).map(|lane| lane.pending.subscribe());
        async move {
            if let Some(mut pending) = pending {
                // A closed channel means the lane was retired, i.e. idle
                let _ = pending.wait_for(|n| *n == 0).await;
            }
        }
    }

    /// Whether `tag` has queued or running operations
    pub fn has_pending(&self, tag: ConcurrencyTag) -> bool {
        self.lanes
            .get(&tag)
            .map(|lane| *lane.pending.borrow() > 0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;
    type BoxedOp = Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Let spawned tasks run until they block
    async fn flush() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    /// An operation that logs its start and only finishes once released
    fn gated(name: &'static str, log: &Log) -> (oneshot::Sender<()>, impl FnOnce() -> BoxedOp) {
        let (release, gate) = oneshot::channel::<()>();
        let log = Arc::clone(log);
        let op = move || -> BoxedOp {
            Box::pin(async move {
                log.lock().push(format!("{name} start"));
                let _ = gate.await;
                log.lock().push(format!("{name} end"));
            })
        };
        (release, op)
    }

    /// Same as `gated`, but also logs when its signal gets aborted
    fn cancellable(
        name: &'static str,
        log: &Log,
    ) -> (oneshot::Sender<()>, impl FnOnce(AbortSignal) -> BoxedOp) {
        let (release, gate) = oneshot::channel::<()>();
        let log = Arc::clone(log);
        let op = move |signal: AbortSignal| -> BoxedOp {
            Box::pin(async move {
                log.lock().push(format!("{name} start"));
                let watcher = {
                    let log = Arc::clone(&log);
                    let signal = signal.clone();
                    tokio::spawn(async move {
                        signal.aborted().await;
                        log.lock().push(format!("{name} canceled"));
                    })
                };
                let _ = gate.await;
                log.lock().push(format!("{name} end"));
                watcher.abort();
            })
        };
        (release, op)
    }

    #[tokio::test]
    async fn test_runs_operations_without_concurrency() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("test");
        let log: Log = Arc::default();

        let (release1, op1) = gated("op1", &log);
        let (release2, op2) = gated("op2", &log);
        let (release3, op3) = gated("op3", &log);

        let ready1 = coordinator.without_concurrency(tag, op1);
        let ready2 = coordinator.without_concurrency(tag, op2);
        let ready3 = coordinator.without_concurrency(tag, op3);
        flush().await;
        assert_eq!(entries(&log), ["op1 start"]);

        release1.send(()).unwrap();
        ready1.await;
        flush().await;
        assert_eq!(entries(&log), ["op1 start", "op1 end", "op2 start"]);

        release2.send(()).unwrap();
        ready2.await;
        release3.send(()).unwrap();
        ready3.await;
        assert_eq!(
            entries(&log),
            ["op1 start", "op1 end", "op2 start", "op2 end", "op3 start", "op3 end"]
        );
    }

    #[tokio::test]
    async fn test_appends_to_partially_drained_lane() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("test");
        let log: Log = Arc::default();

        let (release1, op1) = gated("op1", &log);
        let (release2, op2) = gated("op2", &log);
        let (release3, op3) = gated("op3", &log);

        let ready1 = coordinator.without_concurrency(tag, op1);
        let ready2 = coordinator.without_concurrency(tag, op2);
        release1.send(()).unwrap();
        ready1.await;

        let ready3 = coordinator.without_concurrency(tag, op3);
        flush().await;
        assert_eq!(entries(&log), ["op1 start", "op1 end", "op2 start"]);

        release2.send(()).unwrap();
        ready2.await;
        flush().await;
        assert_eq!(entries(&log).last().map(String::as_str), Some("op3 start"));

        release3.send(()).unwrap();
        ready3.await;
    }

    #[tokio::test]
    async fn test_lanes_run_in_parallel() {
        let coordinator = Coordinator::new();
        let tom = ConcurrencyTag::new("tom");
        let jerry = ConcurrencyTag::new("jerry");
        let log: Log = Arc::default();

        let (release_tom1, tom1) = gated("tom1", &log);
        let (release_tom2, tom2) = gated("tom2", &log);
        let (release_jerry1, jerry1) = gated("jerry1", &log);
        let (release_jerry2, jerry2) = gated("jerry2", &log);

        let ready_tom1 = coordinator.without_concurrency(tom, tom1);
        let ready_tom2 = coordinator.without_concurrency(tom, tom2);
        let ready_jerry1 = coordinator.without_concurrency(jerry, jerry1);
        let ready_jerry2 = coordinator.without_concurrency(jerry, jerry2);
        flush().await;

        let started = entries(&log);
        assert!(started.contains(&"tom1 start".to_string()));
        assert!(started.contains(&"jerry1 start".to_string()));
        assert_eq!(started.len(), 2);

        release_jerry1.send(()).unwrap();
        ready_jerry1.await;
        flush().await;
        assert!(entries(&log).contains(&"jerry2 start".to_string()));
        assert!(!entries(&log).contains(&"tom2 start".to_string()));

        release_tom1.send(()).unwrap();
        release_tom2.send(()).unwrap();
        release_jerry2.send(()).unwrap();
        ready_tom1.await;
        ready_tom2.await;
        ready_jerry2.await;
        assert_eq!(entries(&log).len(), 8);
    }

    #[tokio::test]
    async fn test_tracks_pending_operations() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("test");
        let log: Log = Arc::default();
        assert!(!coordinator.has_pending(tag));

        let (release1, op1) = gated("op1", &log);
        let (release2, op2) = gated("op2", &log);
        let ready1 = coordinator.without_concurrency(tag, op1);
        let ready2 = coordinator.without_concurrency(tag, op2);
        assert!(coordinator.has_pending(tag));

        release1.send(()).unwrap();
        ready1.await;
        assert!(coordinator.has_pending(tag));

        release2.send(()).unwrap();
        ready2.await;
        assert!(!coordinator.has_pending(tag));
    }

    #[tokio::test]
    async fn test_each_caller_gets_its_own_outcome() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("test");

        let failing = coordinator.without_concurrency(tag, || async { Err::<u32, &str>("boom") });
        let succeeding = coordinator.without_concurrency(tag, || async { Ok::<u32, &str>(7) });

        assert_eq!(failing.await, Err("boom"));
        // an earlier failure does not poison the lane
        assert_eq!(succeeding.await, Ok(7));
    }

    #[tokio::test]
    async fn test_cancels_running_operation() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("status");
        let log: Log = Arc::default();

        let (release1, op1) = cancellable("op1", &log);
        let (release2, op2) = cancellable("op2", &log);

        let ready1 = coordinator.with_cancellation(tag, op1);
        flush().await;
        assert_eq!(entries(&log), ["op1 start"]);

        let ready2 = coordinator.with_cancellation(tag, op2);
        flush().await;
        assert_eq!(entries(&log), ["op1 start", "op1 canceled"]);

        release1.send(()).unwrap();
        // a running operation still completes; it was only asked to stop
        assert_eq!(ready1.await, Some(()));
        release2.send(()).unwrap();
        assert_eq!(ready2.await, Some(()));

        assert_eq!(
            entries(&log),
            ["op1 start", "op1 canceled", "op1 end", "op2 start", "op2 end"]
        );
    }

    #[tokio::test]
    async fn test_superseded_before_start_never_runs() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("status");
        let log: Log = Arc::default();

        let (release1, op1) = cancellable("op1", &log);
        let (_release2, op2) = cancellable("op2", &log);
        let (release3, op3) = cancellable("op3", &log);

        let ready1 = coordinator.with_cancellation(tag, op1);
        flush().await;
        let ready2 = coordinator.with_cancellation(tag, op2);
        let ready3 = coordinator.with_cancellation(tag, op3);
        flush().await;

        release1.send(()).unwrap();
        ready1.await;
        release3.send(()).unwrap();
        assert_eq!(ready3.await, Some(()));
        assert_eq!(ready2.await, None);

        assert_eq!(
            entries(&log),
            ["op1 start", "op1 canceled", "op1 end", "op3 start", "op3 end"]
        );
    }

    #[tokio::test]
    async fn test_only_latest_signal_is_live() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("status");
        let (seen_tx, seen_rx) = oneshot::channel();
        let (release, gate) = oneshot::channel::<()>();

        let first = coordinator.with_cancellation(tag, move |signal| async move {
            let _ = gate.await;
            let _ = seen_tx.send(signal.is_aborted());
        });
        let second = coordinator.with_cancellation(tag, |signal| async move { signal.is_aborted() });

        release.send(()).unwrap();
        first.await;
        assert_eq!(seen_rx.await, Ok(true));
        assert_eq!(second.await, Some(false));
    }

    #[tokio::test]
    async fn test_settled_waits_for_idle_lane() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("status");
        let log: Log = Arc::default();

        // idle lanes settle immediately
        coordinator.settled(tag).await;

        let (release, op) = gated("op", &log);
        let ready = coordinator.without_concurrency(tag, op);
        let settled = tokio::spawn(coordinator.settled(tag));
        flush().await;
        assert!(!settled.is_finished());

        release.send(()).unwrap();
        ready.await;
        settled.await.unwrap();
        assert!(!coordinator.has_pending(tag));
    }

    #[tokio::test]
    async fn test_dropped_handle_still_runs() {
        let coordinator = Coordinator::new();
        let tag = ConcurrencyTag::new("test");
        let log: Log = Arc::default();

        let (release, op) = gated("detached", &log);
        drop(coordinator.without_concurrency(tag, op));
        release.send(()).unwrap();
        coordinator.settled(tag).await;

        assert_eq!(entries(&log), ["detached start", "detached end"]);
    }
}
