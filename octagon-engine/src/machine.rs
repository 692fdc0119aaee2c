//! A flag-driven state machine runner.
//!
//! Each machine owns one tokio task, its serial queue. On every pass the task
//! releases pending flags whose delay and condition are both satisfied, then
//! asks the [`TransitionEngine`] for at most one transition given the current
//! state and the ready flags. Only when the engine has nothing to do does a
//! queued request whose source states include the current one get to run.
//!
//! When there is no runnable work the machine reports itself paused and
//! sleeps until a flag or request arrives, the earliest pending deadline
//! passes, or the lock state changes.
//!
//! Never wait on a machine's state from inside one of its own transition
//! ops: the op runs on the queue that would have to make progress.

use crate::error::{OctagonError, OctagonResult};
use crate::flags::{Condition, FlagSnapshot, OctagonFlag, PendingFlag};
use crate::lock::LockStateTracker;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ── Transition ops ───────────────────────────────────────────────

/// One transition: optional state to publish while working, the work that
/// yields the next state, and where to land if the work fails.
pub struct TransitionOp<S> {
    name: &'static str,
    entering: Option<S>,
    fallback: S,
    work: BoxFuture<'static, OctagonResult<S>>,
}

impl<S: Clone + fmt::Display + Send + 'static> TransitionOp<S> {
    pub fn new<F>(name: &'static str, fallback: S, work: F) -> Self
    where
        F: Future<Output = OctagonResult<S>> + Send + 'static,
    {
        Self {
            name,
            entering: None,
            fallback,
            work: Box::pin(work),
        }
    }

    /// An op that moves straight to `state`.
    pub fn to_state(name: &'static str, state: S) -> Self {
        let next = state.clone();
        Self::new(name, state, async move { Ok(next) })
    }

    /// An op answering a caller. The caller gets the value or the error;
    /// the machine moves to the returned state or to `fallback`.
    pub fn for_request<T, F>(name: &'static str, fallback: S, reply: Reply<T>, work: F) -> Self
    where
        T: Send + 'static,
        F: Future<Output = OctagonResult<(S, T)>> + Send + 'static,
    {
        let landing = fallback.clone();
        Self::new(name, fallback, async move {
            match work.await {
                Ok((next, value)) => {
                    reply.send(Ok(value));
                    Ok(next)
                }
                Err(error) => {
                    warn!(op = name, error = %error, fallback = %landing, "request failed");
                    reply.send(Err(error));
                    Ok(landing)
                }
            }
        })
    }

    /// Publishes `state` while the work runs.
    #[must_use]
    pub fn entering(mut self, state: S) -> Self {
        self.entering = Some(state);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<S: fmt::Debug> fmt::Debug for TransitionOp<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionOp")
            .field("name", &self.name)
            .field("entering", &self.entering)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// Decides transitions.
pub trait TransitionEngine: Send + Sync + 'static {
    type State: Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Returns at most one transition for `current`. Flags the engine acts on
    /// are removed from `flags` with [`FlagSnapshot::check_and_remove`]; the
    /// rest stay ready. `handler` schedules pending flags.
    fn next_transition(
        &self,
        current: &Self::State,
        flags: &mut FlagSnapshot,
        handler: &FlagHandler,
    ) -> Option<TransitionOp<Self::State>>;
}

// ── Flags ────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingEntry {
    seq: u64,
    flag: OctagonFlag,
    deadline: Option<Instant>,
    condition: Option<Condition>,
}

#[derive(Debug, Default)]
struct FlagQueueInner {
    ready: Vec<OctagonFlag>,
    pending: Vec<PendingEntry>,
    next_seq: u64,
    /// Bumped whenever new work arrives.
    generation: u64,
}

#[derive(Debug)]
struct FlagQueue {
    inner: Mutex<FlagQueueInner>,
    wake: Notify,
    paused: watch::Sender<bool>,
}

/// Entry point for raising flags. Clones share the queue.
#[derive(Debug, Clone)]
pub struct FlagHandler {
    queue: Arc<FlagQueue>,
}

impl FlagHandler {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            queue: Arc::new(FlagQueue {
                inner: Mutex::new(FlagQueueInner::default()),
                wake: Notify::new(),
                paused,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, FlagQueueInner> {
        self.queue.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raises a flag now. Raising a flag that is already ready is a no-op.
    pub fn handle_flag(&self, flag: OctagonFlag) {
        {
            let mut inner = self.inner();
            if !inner.ready.contains(&flag) {
                inner.ready.push(flag);
            }
            Self::mark_busy(&self.queue, &mut inner);
        }
        debug!(%flag, "flag raised");
        self.queue.wake.notify_one();
    }

    /// Schedules a flag for release once its delay and condition allow.
    pub fn handle_pending_flag(&self, pending: PendingFlag) {
        {
            let mut inner = self.inner();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push(PendingEntry {
                seq,
                flag: pending.flag,
                deadline: pending.delay.map(|d| Instant::now() + d),
                condition: pending.condition,
            });
            Self::mark_busy(&self.queue, &mut inner);
        }
        debug!(flag = %pending.flag, delay = ?pending.delay, condition = ?pending.condition, "flag pending");
        self.queue.wake.notify_one();
    }

    /// Flags raised and not yet consumed.
    pub fn ready_flags(&self) -> Vec<OctagonFlag> {
        self.inner().ready.clone()
    }

    /// Flags still waiting, with their remaining delay.
    pub fn pending_flags(&self) -> Vec<PendingFlag> {
        let now = Instant::now();
        let inner = self.inner();
        inner
            .pending
            .iter()
            .map(|entry| PendingFlag {
                flag: entry.flag,
                delay: entry.deadline.map(|d| d.saturating_duration_since(now)),
                condition: entry.condition,
            })
            .collect()
    }

    fn mark_busy(queue: &FlagQueue, inner: &mut FlagQueueInner) {
        inner.generation += 1;
        queue.paused.send_replace(false);
    }

    /// Wakes the machine for work that is not a flag.
    fn poke(&self) {
        {
            let mut inner = self.inner();
            Self::mark_busy(&self.queue, &mut inner);
        }
        self.queue.wake.notify_one();
    }

    fn generation(&self) -> u64 {
        self.inner().generation
    }

    /// Marks the machine paused unless work arrived since `generation`.
    fn try_pause(&self, generation: u64) -> bool {
        let inner = self.inner();
        if inner.generation != generation {
            return false;
        }
        self.queue.paused.send_replace(true);
        true
    }

    /// Moves due pending flags to the ready set, oldest first. Returns the
    /// earliest deadline still in the future.
    fn release_pending(&self, now: Instant, unlocked: bool) -> Option<Instant> {
        let mut inner = self.inner();
        let mut pending = std::mem::take(&mut inner.pending);
        pending.sort_by_key(|entry| entry.seq);

        let mut next_deadline: Option<Instant> = None;
        let mut kept = Vec::with_capacity(pending.len());
        for entry in pending {
            let delay_done = entry.deadline.is_none_or(|d| d <= now);
            let condition_met = match entry.condition {
                Some(Condition::DeviceUnlocked) => unlocked,
                None => true,
            };
            if delay_done && condition_met {
                debug!(flag = %entry.flag, "pending flag released");
                if !inner.ready.contains(&entry.flag) {
                    inner.ready.push(entry.flag);
                }
                continue;
            }
            if let Some(deadline) = entry.deadline.filter(|d| *d > now) {
                next_deadline = Some(next_deadline.map_or(deadline, |n| n.min(deadline)));
            }
            kept.push(entry);
        }
        inner.pending = kept;
        next_deadline
    }

    fn take_ready(&self) -> FlagSnapshot {
        FlagSnapshot::new(std::mem::take(&mut self.inner().ready))
    }

    /// Puts unconsumed flags back ahead of anything raised meanwhile.
    fn restore(&self, snapshot: FlagSnapshot) {
        let mut inner = self.inner();
        let mut flags = snapshot.into_vec();
        for flag in inner.ready.drain(..) {
            if !flags.contains(&flag) {
                flags.push(flag);
            }
        }
        inner.ready = flags;
    }
}

impl Default for FlagHandler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// The answering half of a request.
pub struct Reply<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<OctagonResult<T>>>>>,
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Reply<T> {
    fn new(tx: oneshot::Sender<OctagonResult<T>>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// The caller stopped waiting, or an answer was already sent.
    pub fn is_abandoned(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }

    pub fn send(&self, result: OctagonResult<T>) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            // The caller may have timed out.
            let _ = tx.send(result);
        }
    }
}

type BuildOp<S> = Box<dyn FnOnce(&S) -> TransitionOp<S> + Send>;

struct QueuedRequest<S> {
    name: &'static str,
    sources: Vec<S>,
    build: BuildOp<S>,
    abandoned: Box<dyn Fn() -> bool + Send>,
}

// ── Runner ───────────────────────────────────────────────────────

struct Shared<E: TransitionEngine> {
    label: String,
    engine: E,
    flags: FlagHandler,
    lock: LockStateTracker,
    state: watch::Sender<E::State>,
    shutdown: watch::Sender<bool>,
    requests: Mutex<VecDeque<QueuedRequest<E::State>>>,
    op_counts: Mutex<HashMap<&'static str, u64>>,
}

impl<E: TransitionEngine> Shared<E> {
    fn next_op(&self) -> Option<TransitionOp<E::State>> {
        let current = self.state.borrow().clone();

        let mut snapshot = self.flags.take_ready();
        let op = self
            .engine
            .next_transition(&current, &mut snapshot, &self.flags);
        self.flags.restore(snapshot);
        if op.is_some() {
            return op;
        }

        let request = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.retain(|r| {
                let abandoned = (r.abandoned)();
                if abandoned {
                    debug!(machine = %self.label, request = r.name, "dropping abandoned request");
                }
                !abandoned
            });
            let index = requests.iter().position(|r| r.sources.contains(&current))?;
            requests.remove(index)?
        };
        debug!(machine = %self.label, request = request.name, state = %current, "starting request");
        Some((request.build)(&current))
    }

    fn set_state(&self, next: E::State) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(machine = %self.label, from = %current, to = %next, "state transition");
            *current = next;
            true
        });
    }

    async fn execute(&self, op: TransitionOp<E::State>) {
        let TransitionOp {
            name,
            entering,
            fallback,
            work,
        } = op;
        *self
            .op_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name)
            .or_default() += 1;
        if let Some(state) = entering {
            self.set_state(state);
        }
        debug!(machine = %self.label, op = name, "running transition");
        let next = match work.await {
            Ok(next) => next,
            Err(error) => {
                warn!(machine = %self.label, op = name, error = %error, fallback = %fallback, "transition failed");
                fallback
            }
        };
        self.set_state(next);
    }
}

async fn run<E: TransitionEngine>(shared: Arc<Shared<E>>) {
    let mut lock_rx = shared.lock.subscribe();
    let mut shutdown_rx = shared.shutdown.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let generation = shared.flags.generation();
        let deadline = shared
            .flags
            .release_pending(Instant::now(), !shared.lock.is_locked());

        if let Some(op) = shared.next_op() {
            shared.execute(op).await;
            continue;
        }
        if !shared.flags.try_pause(generation) {
            continue;
        }

        let sleep = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            () = shared.flags.queue.wake.notified() => {}
            () = sleep => {}
            changed = lock_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {}
        }
    }
    debug!(machine = %shared.label, "state machine stopped");
}

/// Handle to a running state machine. Dropping it stops the task.
pub struct StateMachine<E: TransitionEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: TransitionEngine> StateMachine<E> {
    /// Spawns the machine's task. Must be called within a tokio runtime.
    pub fn start(
        label: impl Into<String>,
        engine: E,
        initial: E::State,
        flags: FlagHandler,
        lock: LockStateTracker,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            label: label.into(),
            engine,
            flags,
            lock,
            state,
            shutdown,
            requests: Mutex::new(VecDeque::new()),
            op_counts: Mutex::new(HashMap::new()),
        });
        tokio::spawn(run(Arc::clone(&shared)));
        Self { shared }
    }

    pub fn current_state(&self) -> E::State {
        self.shared.state.borrow().clone()
    }

    pub fn flags(&self) -> &FlagHandler {
        &self.shared.flags
    }

    pub fn subscribe(&self) -> watch::Receiver<E::State> {
        self.shared.state.subscribe()
    }

    /// How many times the named op has started.
    pub fn op_count(&self, name: &str) -> u64 {
        self.shared
            .op_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Waits until the machine is in `state`.
    pub async fn wait_for_state(&self, state: E::State, timeout: Duration) -> OctagonResult<()> {
        let mut rx = self.shared.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(OctagonError::ChannelClosed),
            Err(_) => Err(OctagonError::Timeout),
        }
    }

    /// Waits until the machine has no runnable work.
    pub async fn wait_for_pause(&self, timeout: Duration) -> OctagonResult<()> {
        let mut rx = self.shared.flags.queue.paused.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|paused| *paused)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(OctagonError::ChannelClosed),
            Err(_) => Err(OctagonError::Timeout),
        }
    }

    /// Queues work that runs once the machine is in one of `sources` and no
    /// flag-driven transition is ready. Returns `Timeout` if no answer comes
    /// within `timeout`; work already started carries on regardless.
    pub async fn request<T, B>(
        &self,
        name: &'static str,
        sources: &[E::State],
        timeout: Duration,
        build: B,
    ) -> OctagonResult<T>
    where
        T: Send + 'static,
        B: FnOnce(&E::State, Reply<T>) -> TransitionOp<E::State> + Send + 'static,
    {
        if *self.shared.shutdown.borrow() {
            return Err(OctagonError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        let reply = Reply::new(tx);
        let watcher = reply.clone();
        {
            let mut requests = self
                .shared
                .requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            requests.push_back(QueuedRequest {
                name,
                sources: sources.to_vec(),
                build: Box::new(move |current: &E::State| build(current, reply)),
                abandoned: Box::new(move || watcher.is_abandoned()),
            });
        }
        self.shared.flags.poke();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OctagonError::ChannelClosed),
            Err(_) => {
                debug!(machine = %self.shared.label, request = name, "caller timed out");
                Err(OctagonError::Timeout)
            }
        }
    }

    /// Stops the task after its current op.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl<E: TransitionEngine> Drop for StateMachine<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<E: TransitionEngine> fmt::Debug for StateMachine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("label", &self.shared.label)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}
