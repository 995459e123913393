//! Priority-ordered ready queue.
//!
//! Tasks with unsatisfied dependencies are held in a waiting set and become
//! ready only once their last dependency completes. Grounded on the task
//! tracking split (`pending_tasks` / `dependency_waiting` / per-priority
//! queues) used by the original queue manager component.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use snafu::Snafu;
use uuid::Uuid;

use crate::workflow::{ErrorStrategy, Priority, Task};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("task {id} not found in queue"))]
    TaskNotFound { id: Uuid },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

struct WaitingTask {
    task: Task,
    pending_deps: HashSet<Uuid>,
}

#[derive(Default)]
struct Inner {
    /// Ready tasks ordered by (priority descending, created_at ascending).
    ready: HashMap<Priority, VecDeque<Task>>,
    waiting: HashMap<Uuid, WaitingTask>,
    /// dependency id -> ids of tasks depending on it, still unresolved.
    dependents: HashMap<Uuid, HashSet<Uuid>>,
    error_strategy: HashMap<Uuid, ErrorStrategy>,
}

/// A thread-safe priority queue of tasks ready for dispatch, with dependency
/// tracking folded in. All operations are safe for concurrent callers.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Inserts all tasks; those with unsatisfied dependencies are held.
    /// `dependency_ids` maps each task's declared `dependencies` (name or id
    /// strings) to the resolved task ids within the same workflow.
    pub fn enqueue_batch(
        &self,
        tasks: Vec<Task>,
        dependency_ids: &HashMap<Uuid, Vec<Uuid>>,
        error_strategy: ErrorStrategy,
    ) {
        let mut inner = self.lock();
        for task in tasks {
            let task_id = task.id;
            inner.error_strategy.insert(task_id, error_strategy);
            let deps: HashSet<Uuid> = dependency_ids.get(&task_id).cloned().unwrap_or_default();
            if deps.is_empty() {
                Self::push_ready(&mut inner, task);
            } else {
                for dep in &deps {
                    inner.dependents.entry(*dep).or_default().insert(task_id);
                }
                inner.waiting.insert(
                    task_id,
                    WaitingTask {
                        task,
                        pending_deps: deps,
                    },
                );
            }
        }
    }

    fn push_ready(inner: &mut Inner, task: Task) {
        inner.ready.entry(task.priority).or_default().push_back(task);
    }

    /// Returns the highest-priority ready task whose protocol/method is
    /// supported by `accepts`, if any. Non-blocking: callers needing to wait
    /// for a completion poll again.
    pub fn dequeue(&self, accepts: impl Fn(&Task) -> bool) -> Option<Task> {
        let mut inner = self.lock();
        for priority in [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low] {
            if let Some(queue) = inner.ready.get_mut(&priority) {
                if let Some(pos) = queue.iter().position(|t| accepts(t)) {
                    return queue.remove(pos);
                }
            }
        }
        None
    }

    /// Marks `id` completed; returns the ids of tasks that just became ready.
    pub fn mark_completed(&self, id: Uuid, _result: Option<Value>) -> Vec<Uuid> {
        let mut inner = self.lock();
        let mut newly_ready = Vec::new();
        let Some(dependents) = inner.dependents.remove(&id) else {
            return newly_ready;
        };
        for dep_task_id in dependents {
            let ready = if let Some(waiting) = inner.waiting.get_mut(&dep_task_id) {
                waiting.pending_deps.remove(&id);
                waiting.pending_deps.is_empty()
            } else {
                false
            };
            if ready {
                if let Some(waiting) = inner.waiting.remove(&dep_task_id) {
                    newly_ready.push(dep_task_id);
                    Self::push_ready(&mut inner, waiting.task);
                }
            }
        }
        newly_ready
    }

    /// Marks `id` failed. Under `Stop`, every transitive dependent is
    /// removed from the waiting set (the caller persists them as
    /// FAILED/DependencyFailed). Under `Continue`, a direct dependent is
    /// only cascaded into failure if `requires_result(dependent_id)`
    /// returns true (it substitution-references the failed task's result);
    /// otherwise it is treated as satisfied for ordering purposes and
    /// released toward the ready queue once its remaining dependencies
    /// clear. Returns `(newly_ready, cascaded_failures)`.
    pub fn mark_failed(&self, id: Uuid, requires_result: impl Fn(Uuid) -> bool) -> (Vec<Uuid>, Vec<Uuid>) {
        let mut inner = self.lock();
        Self::remove_from_ready(&mut inner, id);

        let mut newly_ready = Vec::new();
        let mut cascaded = Vec::new();
        let mut frontier = vec![id];

        while let Some(current) = frontier.pop() {
            let Some(dependents) = inner.dependents.remove(&current) else {
                continue;
            };
            for dep_task_id in dependents {
                let strategy = inner
                    .error_strategy
                    .get(&dep_task_id)
                    .copied()
                    .unwrap_or(ErrorStrategy::Stop);

                let should_cascade = strategy == ErrorStrategy::Stop || requires_result(dep_task_id);

                if should_cascade {
                    if inner.waiting.remove(&dep_task_id).is_some() {
                        cascaded.push(dep_task_id);
                        frontier.push(dep_task_id);
                    }
                } else {
                    let became_ready = if let Some(waiting) = inner.waiting.get_mut(&dep_task_id) {
                        waiting.pending_deps.remove(&current);
                        waiting.pending_deps.is_empty()
                    } else {
                        false
                    };
                    if became_ready {
                        if let Some(waiting) = inner.waiting.remove(&dep_task_id) {
                            newly_ready.push(dep_task_id);
                            Self::push_ready(&mut inner, waiting.task);
                        }
                    }
                }
            }
        }

        (newly_ready, cascaded)
    }

    fn remove_from_ready(inner: &mut Inner, id: Uuid) {
        for queue in inner.ready.values_mut() {
            queue.retain(|t| t.id != id);
        }
    }

    /// Removes a task from the ready queue or waiting set. Returns `true` if
    /// it was found.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut inner = self.lock();
        let was_waiting = inner.waiting.remove(&id).is_some();
        let before: usize = inner.ready.values().map(VecDeque::len).sum();
        Self::remove_from_ready(&mut inner, id);
        let after: usize = inner.ready.values().map(VecDeque::len).sum();
        was_waiting || before != after
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.lock().ready.values().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(wf: Uuid, name: &str, priority: Priority) -> Task {
        let mut t = Task::new(wf, name, "echo/v1", "echo/echo", serde_json::json!({}));
        t.priority = priority;
        t
    }

    #[test]
    fn independent_task_is_immediately_ready() {
        let queue = TaskQueue::new();
        let wf = Uuid::new_v4();
        let t = task(wf, "A", Priority::Normal);
        queue.enqueue_batch(vec![t], &HashMap::new(), ErrorStrategy::Stop);
        assert_eq!(queue.ready_len(), 1);
        assert_eq!(queue.waiting_len(), 0);
    }

    #[test]
    fn dependent_task_waits_then_becomes_ready() {
        let queue = TaskQueue::new();
        let wf = Uuid::new_v4();
        let a = task(wf, "A", Priority::Normal);
        let b = task(wf, "B", Priority::Normal);
        let a_id = a.id;
        let b_id = b.id;
        let mut deps = HashMap::new();
        deps.insert(b_id, vec![a_id]);
        queue.enqueue_batch(vec![a, b], &deps, ErrorStrategy::Stop);
        assert_eq!(queue.ready_len(), 1);
        assert_eq!(queue.waiting_len(), 1);

        let ready_ids = queue.mark_completed(a_id, None);
        assert_eq!(ready_ids, vec![b_id]);
        assert_eq!(queue.ready_len(), 1);
        assert_eq!(queue.waiting_len(), 0);
    }

    #[test]
    fn priority_order_dequeues_highest_first() {
        let queue = TaskQueue::new();
        let wf = Uuid::new_v4();
        let low = task(wf, "low", Priority::Low);
        let urgent = task(wf, "urgent", Priority::Urgent);
        queue.enqueue_batch(vec![low, urgent], &HashMap::new(), ErrorStrategy::Stop);
        let first = queue.dequeue(|_| true).unwrap();
        assert_eq!(first.name, "urgent");
    }

    #[test]
    fn stop_strategy_propagates_failure_to_dependents() {
        let queue = TaskQueue::new();
        let wf = Uuid::new_v4();
        let a = task(wf, "A", Priority::Normal);
        let b = task(wf, "B", Priority::Normal);
        let a_id = a.id;
        let b_id = b.id;
        let mut deps = HashMap::new();
        deps.insert(b_id, vec![a_id]);
        queue.enqueue_batch(vec![a, b], &deps, ErrorStrategy::Stop);

        let (ready, cascaded) = queue.mark_failed(a_id, |_| false);
        assert_eq!(cascaded, vec![b_id]);
        assert!(ready.is_empty());
        assert_eq!(queue.waiting_len(), 0);
    }

    #[test]
    fn continue_strategy_releases_ordering_only_dependent() {
        let queue = TaskQueue::new();
        let wf = Uuid::new_v4();
        let a = task(wf, "A", Priority::Normal);
        let b = task(wf, "B", Priority::Normal);
        let a_id = a.id;
        let b_id = b.id;
        let mut deps = HashMap::new();
        deps.insert(b_id, vec![a_id]);
        queue.enqueue_batch(vec![a, b], &deps, ErrorStrategy::Continue);

        let (ready, cascaded) = queue.mark_failed(a_id, |_| false);
        assert_eq!(ready, vec![b_id]);
        assert!(cascaded.is_empty());
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.ready_len(), 1);
    }

    #[test]
    fn continue_strategy_cascades_when_result_required() {
        let queue = TaskQueue::new();
        let wf = Uuid::new_v4();
        let a = task(wf, "A", Priority::Normal);
        let b = task(wf, "B", Priority::Normal);
        let a_id = a.id;
        let b_id = b.id;
        let mut deps = HashMap::new();
        deps.insert(b_id, vec![a_id]);
        queue.enqueue_batch(vec![a, b], &deps, ErrorStrategy::Continue);

        let (ready, cascaded) = queue.mark_failed(a_id, |id| id == b_id);
        assert!(ready.is_empty());
        assert_eq!(cascaded, vec![b_id]);
    }

    #[test]
    fn cancel_removes_ready_task() {
        let queue = TaskQueue::new();
        let wf = Uuid::new_v4();
        let a = task(wf, "A", Priority::Normal);
        let a_id = a.id;
        queue.enqueue_batch(vec![a], &HashMap::new(), ErrorStrategy::Stop);
        assert!(queue.cancel(a_id));
        assert_eq!(queue.ready_len(), 0);
    }
}
