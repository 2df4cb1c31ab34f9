//! Dependency-aware task scheduler.
//!
//! Tasks live in an arena and are addressed by [`TaskId`]; dependency
//! edges are index lists in both directions, so cancellation and failure
//! propagation are plain graph walks. A task becomes ready when every
//! dependency has finished successfully. Ready tasks start in FIFO order
//! while fewer than the concurrency limit are running and the scheduler
//! is not suspended.
//!
//! A dependency that fails or is cancelled resolves all of its pending
//! dependents the same way without starting them.
//!
//! Slots of terminal tasks are reused once no [`TaskHandle`] observes them
//! and every task depending on them has been reclaimed. Ids carry a
//! generation, so a stale id never addresses the slot's next occupant.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Default number of simultaneously running tasks.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Arena size below which terminal slots are not reclaimed.
const RECLAIM_THRESHOLD: usize = 64;

/// Boxed future produced by a task body.
pub type TaskFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'static>>;

type TaskWork<E> = Box<dyn FnOnce(TaskContext) -> TaskFuture<E> + Send + 'static>;

/// Handle into the scheduler's task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    index: usize,
    generation: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

/// Terminal result of a task, delivered to every handle.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<E> {
    Finished,
    Failed(E),
    Cancelled,
}

impl<E> TaskOutcome<E> {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    fn state(&self) -> TaskState {
        match self {
            Self::Finished => TaskState::Finished,
            Self::Failed(_) => TaskState::Failed,
            Self::Cancelled => TaskState::Cancelled,
        }
    }
}

/// A task body that panicked. The scheduler's error type converts it into
/// the task's failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {label} panicked: {message}")]
pub struct TaskPanic {
    pub label: String,
    pub message: String,
}

impl From<TaskPanic> for String {
    fn from(panic: TaskPanic) -> Self {
        panic.to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Passed to a running task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Token cancelled when the task is cancelled while running. Bodies
    /// check it before scheduling further sub-work.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of work waiting to be submitted.
pub struct Task<E> {
    label: String,
    weight: u64,
    fail_fast: bool,
    work: TaskWork<E>,
}

impl<E: Send + 'static> Task<E> {
    pub fn new<F, Fut>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Self {
            label: label.into(),
            weight: 0,
            fail_fast: false,
            work: Box::new(move |ctx| Box::pin(work(ctx))),
        }
    }

    /// A task that completes immediately.
    pub fn noop(label: impl Into<String>) -> Self {
        Self::new(label, |_| async { Ok(()) })
    }

    /// Units of work this task accounts for.
    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    /// Makes a failure of this task cancel its siblings, the tasks sharing
    /// one of its dependencies, before another of them can start.
    ///
    /// Dependents of the failed task still resolve with its error.
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

/// Cloneable, awaitable view of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle<E> {
    id: TaskId,
    rx: watch::Receiver<Option<TaskOutcome<E>>>,
}

impl<E: Clone> TaskHandle<E> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the outcome if the task has reached a terminal state.
    pub fn outcome(&self) -> Option<TaskOutcome<E>> {
        self.rx.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for the task to reach a terminal state.
    ///
    /// Resolves as cancelled if the scheduler is dropped first.
    pub async fn wait(&self) -> TaskOutcome<E> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().unwrap_or(TaskOutcome::Cancelled);
            }
        }
    }
}

struct Slot<E> {
    label: String,
    weight: u64,
    fail_fast: bool,
    deps: Vec<TaskId>,
    dependents: Vec<TaskId>,
    unfinished_deps: usize,
    state: TaskState,
    work: Option<TaskWork<E>>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<TaskOutcome<E>>>,
}

impl<E: Clone> Slot<E> {
    fn resolve(&mut self, outcome: TaskOutcome<E>) {
        self.state = outcome.state();
        self.work = None;
        self.outcome.send_replace(Some(outcome));
    }
}

struct Entry<E> {
    generation: u32,
    slot: Option<Slot<E>>,
}

struct Inner<E> {
    tasks: Vec<Entry<E>>,
    free: Vec<usize>,
    live: usize,
    reclaim_at: usize,
    ready: VecDeque<TaskId>,
    running: usize,
    limit: usize,
    suspended: bool,
}

impl<E: Clone> Inner<E> {
    fn get(&self, id: TaskId) -> Option<&Slot<E>> {
        self.tasks
            .get(id.index)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.slot.as_ref())
    }

    fn get_mut(&mut self, id: TaskId) -> Option<&mut Slot<E>> {
        self.tasks
            .get_mut(id.index)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.slot.as_mut())
    }

    fn live_ids(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.slot.is_some())
            .map(|(index, entry)| TaskId {
                index,
                generation: entry.generation,
            })
            .collect()
    }

    fn allocate(&mut self, slot: Slot<E>) -> TaskId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.tasks[index];
                entry.slot = Some(slot);
                TaskId {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                self.tasks.push(Entry {
                    generation: 0,
                    slot: Some(slot),
                });
                TaskId {
                    index: self.tasks.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    /// Frees terminal slots nobody observes and nothing live depends on.
    /// A slot is freed only after all of its dependents, so a walk from
    /// any live task still reaches every task downstream of it.
    fn reclaim(&mut self) -> usize {
        let mut stack = self.live_ids();
        let mut freed = 0;
        while let Some(id) = stack.pop() {
            let Some(slot) = self.get(id) else {
                continue;
            };
            if !slot.state.is_terminal()
                || slot.outcome.receiver_count() > 0
                || slot.dependents.iter().any(|d| self.get(*d).is_some())
            {
                continue;
            }
            let deps = slot.deps.clone();
            let entry = &mut self.tasks[id.index];
            entry.slot = None;
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(id.index);
            self.live -= 1;
            freed += 1;
            stack.extend(deps);
        }
        freed
    }

    /// Resolves every non-terminal task reachable from `roots` through
    /// dependent edges, walking through tasks that already finished.
    /// Running tasks are signalled and resolve when their body returns.
    fn resolve_dependents(&mut self, roots: Vec<TaskId>, outcome: &TaskOutcome<E>) {
        let mut seen = HashSet::new();
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(slot) = self.get_mut(id) else {
                continue;
            };
            match slot.state {
                TaskState::Pending => slot.resolve(outcome.clone()),
                TaskState::Running => slot.cancel.cancel(),
                _ => {}
            }
            stack.extend(slot.dependents.iter().copied());
        }
    }

    fn cancel_from(&mut self, id: TaskId) {
        self.resolve_dependents(vec![id], &TaskOutcome::Cancelled);
    }

    /// Tasks other than `id` that share one of its dependencies.
    fn siblings(&self, id: TaskId, deps: &[TaskId]) -> Vec<TaskId> {
        deps.iter()
            .filter_map(|dep| self.get(*dep))
            .flat_map(|dep| dep.dependents.iter().copied())
            .filter(|sibling| *sibling != id)
            .collect()
    }

    /// Links `dependent` to `deps`. Returns the outcome to inherit if a
    /// dependency already failed or was cancelled.
    fn link(&mut self, dependent: TaskId, deps: &[TaskId]) -> Option<TaskOutcome<E>> {
        let mut inherited = None;
        let mut linked = Vec::with_capacity(deps.len());
        let mut unfinished = 0;
        for &dep in deps {
            let Some(slot) = self.get_mut(dep) else {
                warn!(task = %dependent, dep = %dep, "unknown dependency ignored");
                continue;
            };
            match slot.state {
                TaskState::Failed | TaskState::Cancelled => {
                    if inherited.is_none() {
                        inherited = slot.outcome.borrow().clone();
                    }
                }
                state => {
                    // Finished dependencies keep the edge so cancelling
                    // them still reaches this task.
                    slot.dependents.push(dependent);
                    linked.push(dep);
                    if state != TaskState::Finished {
                        unfinished += 1;
                    }
                }
            }
        }
        if let Some(slot) = self.get_mut(dependent) {
            slot.deps.extend(linked);
            slot.unfinished_deps += unfinished;
        }
        inherited
    }
}

/// Executes [`Task`]s on the tokio runtime respecting dependency edges,
/// a concurrency limit and a suspended flag.
///
/// Cloning yields another handle to the same scheduler.
pub struct TaskScheduler<E> {
    shared: Arc<Mutex<Inner<E>>>,
}

impl<E> Clone for TaskScheduler<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> Default for TaskScheduler<E>
where
    E: Clone + Send + Sync + From<TaskPanic> + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl<E> TaskScheduler<E>
where
    E: Clone + Send + Sync + From<TaskPanic> + 'static,
{
    /// Creates a scheduler running at most `limit` tasks at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Inner {
                tasks: Vec::new(),
                free: Vec::new(),
                live: 0,
                reclaim_at: RECLAIM_THRESHOLD,
                ready: VecDeque::new(),
                running: 0,
                limit: limit.max(1),
                suspended: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits a task that runs once all `deps` have finished.
    ///
    /// If a dependency already failed or was cancelled the task resolves
    /// the same way immediately and never runs.
    pub fn submit(&self, task: Task<E>, deps: &[TaskId]) -> TaskHandle<E> {
        let handle = {
            let mut inner = self.lock();
            let (tx, rx) = watch::channel(None);
            let id = inner.allocate(Slot {
                label: task.label,
                weight: task.weight,
                fail_fast: task.fail_fast,
                deps: Vec::new(),
                dependents: Vec::new(),
                unfinished_deps: 0,
                state: TaskState::Pending,
                work: Some(task.work),
                cancel: CancellationToken::new(),
                outcome: tx,
            });

            let inherited = inner.link(id, deps);
            let unfinished = inner.get(id).map_or(0, |slot| slot.unfinished_deps);
            match inherited {
                Some(outcome) => {
                    trace!(task = %id, "dependency already resolved, not starting");
                    if let Some(slot) = inner.get_mut(id) {
                        slot.resolve(outcome);
                    }
                }
                None if unfinished == 0 => inner.ready.push_back(id),
                None => {}
            }

            // After linking, so the new edges keep `deps` alive.
            if inner.free.is_empty() && inner.tasks.len() >= inner.reclaim_at {
                let freed = inner.reclaim();
                inner.reclaim_at = (inner.live * 2).max(RECLAIM_THRESHOLD);
                trace!(freed, live = inner.live, "reclaimed terminal tasks");
            }
            TaskHandle { id, rx }
        };
        self.pump();
        handle
    }

    /// Adds dependencies to a task that has not started yet.
    ///
    /// Returns `false` if the task is no longer pending.
    pub fn add_dependencies(&self, task: TaskId, deps: &[TaskId]) -> bool {
        let mut inner = self.lock();
        if inner.get(task).map(|slot| slot.state) != Some(TaskState::Pending) {
            return false;
        }
        if let Some(outcome) = inner.link(task, deps) {
            let dependents = match inner.get_mut(task) {
                Some(slot) => {
                    slot.resolve(outcome.clone());
                    slot.dependents.clone()
                }
                None => Vec::new(),
            };
            inner.resolve_dependents(dependents, &outcome);
        } else if inner.get(task).is_some_and(|slot| slot.unfinished_deps > 0) {
            inner.ready.retain(|id| *id != task);
        }
        true
    }

    /// Cancels `task` and every non-terminal task depending on it, also
    /// through dependents that already finished.
    ///
    /// A pending task resolves as cancelled at once. A running task is
    /// signalled through its [`TaskContext`] and resolves as cancelled when
    /// its body returns, whatever the body's result.
    pub fn cancel(&self, task: TaskId) {
        let mut inner = self.lock();
        let Some(slot) = inner.get(task) else {
            return;
        };
        debug!(task = %task, label = %slot.label, "cancelling");
        inner.cancel_from(task);
    }

    /// Cancels every task that has not reached a terminal state.
    pub fn cancel_all(&self) {
        let mut inner = self.lock();
        for id in inner.live_ids() {
            inner.cancel_from(id);
        }
    }

    pub fn set_concurrency_limit(&self, limit: usize) {
        self.lock().limit = limit.max(1);
        self.pump();
    }

    pub fn concurrency_limit(&self) -> usize {
        self.lock().limit
    }

    /// Stops starting new tasks. Running tasks are not interrupted.
    pub fn suspend(&self) {
        self.lock().suspended = true;
        debug!("scheduler suspended");
    }

    pub fn resume(&self) {
        self.lock().suspended = false;
        debug!("scheduler resumed");
        self.pump();
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// State of `task`, or `None` once its slot has been reclaimed.
    pub fn state(&self, task: TaskId) -> Option<TaskState> {
        self.lock().get(task).map(|s| s.state)
    }

    pub fn weight(&self, task: TaskId) -> Option<u64> {
        self.lock().get(task).map(|s| s.weight)
    }

    /// Number of running tasks.
    pub fn running(&self) -> usize {
        self.lock().running
    }

    /// Number of ready tasks waiting for a free slot.
    pub fn queued(&self) -> usize {
        let inner = self.lock();
        inner
            .ready
            .iter()
            .filter(|id| inner.get(**id).is_some_and(|s| s.state == TaskState::Pending))
            .count()
    }

    /// Number of tasks still held in the arena, reclaimed slots excluded.
    pub fn tracked(&self) -> usize {
        self.lock().live
    }

    /// Starts ready tasks while slots are free.
    fn pump(&self) {
        let mut starting = Vec::new();
        {
            let mut inner = self.lock();
            while !inner.suspended && inner.running < inner.limit {
                let Some(id) = inner.ready.pop_front() else {
                    break;
                };
                let Some(slot) = inner.get_mut(id) else {
                    continue;
                };
                if slot.state != TaskState::Pending {
                    continue;
                }
                let Some(work) = slot.work.take() else {
                    continue;
                };
                slot.state = TaskState::Running;
                let ctx = TaskContext {
                    id,
                    cancel: slot.cancel.clone(),
                };
                let label = slot.label.clone();
                trace!(task = %id, label = %label, "starting");
                inner.running += 1;
                starting.push((id, label, work, ctx));
            }
        }

        for (id, label, work, ctx) in starting {
            let scheduler = self.clone();
            tokio::spawn(async move {
                // Cancelled before first poll: the body never runs and
                // `complete` resolves the task as cancelled.
                if ctx.is_cancelled() {
                    scheduler.complete(id, Ok(()));
                    return;
                }
                let result = match AssertUnwindSafe(async move { work(ctx).await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(task = %id, label = %label, message = %message, "task panicked");
                        Err(E::from(TaskPanic { label, message }))
                    }
                };
                scheduler.complete(id, result);
            });
        }
    }

    /// Records the result of a running task.
    fn complete(&self, id: TaskId, result: Result<(), E>) {
        {
            let mut inner = self.lock();
            inner.running = inner.running.saturating_sub(1);
            let Some(slot) = inner.get_mut(id) else {
                drop(inner);
                self.pump();
                return;
            };
            let outcome = if slot.cancel.is_cancelled() {
                TaskOutcome::Cancelled
            } else {
                match result {
                    Ok(()) => TaskOutcome::Finished,
                    Err(e) => TaskOutcome::Failed(e),
                }
            };
            trace!(task = %id, label = %slot.label, state = ?outcome.state(), "completed");
            slot.resolve(outcome.clone());
            let dependents = slot.dependents.clone();
            let fail_fast_deps = (slot.fail_fast && matches!(outcome, TaskOutcome::Failed(_)))
                .then(|| slot.deps.clone());

            if outcome.is_finished() {
                for dep in dependents {
                    let Some(slot) = inner.get_mut(dep) else {
                        continue;
                    };
                    if slot.state != TaskState::Pending {
                        continue;
                    }
                    slot.unfinished_deps = slot.unfinished_deps.saturating_sub(1);
                    if slot.unfinished_deps == 0 {
                        inner.ready.push_back(dep);
                    }
                }
            } else {
                inner.resolve_dependents(dependents, &outcome);
            }

            // Dependents already carry the error; siblings are cancelled
            // before `pump` can start one of them.
            if let Some(deps) = fail_fast_deps {
                let siblings = inner.siblings(id, &deps);
                debug!(task = %id, siblings = siblings.len(), "failure cancels sibling tasks");
                inner.resolve_dependents(siblings, &TaskOutcome::Cancelled);
            }
        }
        self.pump();
    }
}
