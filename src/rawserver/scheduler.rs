use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct Entry<T> {
    deadline: Instant,
    id: u64,
    task: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must
    // come out first. Equal deadlines run in scheduling order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Deadline-ordered queue of pending tasks.
///
/// Cancellation is by [`TaskId`]; cancelled entries stay in the heap and
/// are skipped when they surface.
pub struct TaskQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    pending: HashSet<u64>,
    next_id: u64,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, task: T) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id);
        self.heap.push(Entry { deadline, id, task });
        TaskId(id)
    }

    pub fn schedule_in(&mut self, delay: Duration, task: T) -> TaskId {
        self.schedule(Instant::now() + delay, task)
    }

    /// Returns false if the task already ran or was cancelled.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.pending.remove(&id.0)
    }

    fn discard_cancelled(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.pending.contains(&entry.id) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Removes and returns the earliest task due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        self.discard_cancelled();
        if self.heap.peek()?.deadline > now {
            return None;
        }
        let entry = self.heap.pop()?;
        self.pending.remove(&entry.id);
        Some(entry.task)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
