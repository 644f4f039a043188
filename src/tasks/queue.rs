//! In-memory dispatch order: FIFO within a project, round-robin across
//! projects with queued work.

use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: String,
    pub project_id: String,
}

impl QueueEntry {
    pub fn new(task_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            project_id: project_id.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FairQueue {
    /// Projects with queued work, in turn order.
    rotation: VecDeque<String>,
    per_project: HashMap<String, VecDeque<String>>,
    /// Every task id that is queued or being dispatched.
    known: HashSet<String>,
    len: usize,
}

impl FairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task. Returns `false` when the id is already known.
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        if !self.known.insert(entry.task_id.clone()) {
            return false;
        }
        self.enqueue(entry, false);
        true
    }

    /// Put a popped task back at the head of its project's queue.
    ///
    /// The project itself goes to the back of the rotation so other
    /// projects get their turn first.
    pub fn push_front(&mut self, entry: QueueEntry) {
        self.known.insert(entry.task_id.clone());
        self.enqueue(entry, true);
    }

    fn enqueue(&mut self, entry: QueueEntry, front: bool) {
        let queue = self.per_project.entry(entry.project_id.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(entry.project_id.clone());
        }
        if front {
            queue.push_front(entry.task_id);
        } else {
            queue.push_back(entry.task_id);
        }
        self.len += 1;
    }

    /// Next task: the head of the project whose turn it is.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        let project = self.rotation.pop_front()?;
        let queue = self.per_project.get_mut(&project)?;
        let task_id = queue.pop_front()?;
        self.len -= 1;
        if queue.is_empty() {
            self.per_project.remove(&project);
        } else {
            self.rotation.push_back(project.clone());
        }
        Some(QueueEntry {
            task_id,
            project_id: project,
        })
    }

    /// Drop a queued task, e.g. after it was cancelled.
    pub fn remove(&mut self, task_id: &str) -> bool {
        self.known.remove(task_id);
        let mut emptied = None;
        let mut found = false;
        for (project, queue) in self.per_project.iter_mut() {
            if let Some(pos) = queue.iter().position(|id| id == task_id) {
                queue.remove(pos);
                self.len -= 1;
                found = true;
                if queue.is_empty() {
                    emptied = Some(project.clone());
                }
                break;
            }
        }
        if let Some(project) = emptied {
            self.per_project.remove(&project);
            self.rotation.retain(|p| p != &project);
        }
        found
    }

    /// Forget a dispatched task so a later refill may enqueue it again.
    pub fn forget(&mut self, task_id: &str) {
        self.known.remove(task_id);
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.known.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &mut FairQueue) -> Vec<String> {
        std::iter::from_fn(|| q.pop().map(|e| e.task_id)).collect()
    }

    #[test]
    fn round_robin_across_projects_fifo_within() {
        let mut q = FairQueue::new();
        for (t, p) in [("a1", "A"), ("a2", "A"), ("a3", "A"), ("b1", "B"), ("c1", "C"), ("b2", "B")] {
            assert!(q.push(QueueEntry::new(t, p)));
        }
        assert_eq!(q.len(), 6);
        assert_eq!(drain(&mut q), vec!["a1", "b1", "c1", "a2", "b2", "a3"]);
        assert!(q.is_empty());
    }

    #[test]
    fn duplicates_are_ignored_until_forgotten() {
        let mut q = FairQueue::new();
        assert!(q.push(QueueEntry::new("t", "P")));
        assert!(!q.push(QueueEntry::new("t", "P")));
        let e = q.pop().unwrap();
        assert!(q.contains(&e.task_id));
        assert!(!q.push(QueueEntry::new("t", "P")));
        q.forget("t");
        assert!(q.push(QueueEntry::new("t", "P")));
    }

    #[test]
    fn push_front_keeps_project_order() {
        let mut q = FairQueue::new();
        q.push(QueueEntry::new("a1", "A"));
        q.push(QueueEntry::new("a2", "A"));
        q.push(QueueEntry::new("b1", "B"));
        let head = q.pop().unwrap();
        assert_eq!(head.task_id, "a1");
        q.push_front(head);
        assert_eq!(drain(&mut q), vec!["b1", "a1", "a2"]);
    }

    #[test]
    fn remove_drops_empty_projects() {
        let mut q = FairQueue::new();
        q.push(QueueEntry::new("a1", "A"));
        q.push(QueueEntry::new("b1", "B"));
        assert!(q.remove("a1"));
        assert!(!q.remove("a1"));
        assert_eq!(drain(&mut q), vec!["b1"]);
    }
}
