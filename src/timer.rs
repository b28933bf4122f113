//! Indexed min-heap of per-connection idle deadlines.
//!
//! The heap is keyed by connection descriptor through an id-to-slot map,
//! giving O(log n) add, update, and cancel for arbitrary entries. Nodes hold
//! only the id and the deadline; when an entry expires the reactor looks the
//! id up in its own connection table, so a connection closed before its
//! deadline leaves nothing dangling behind.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    id: RawFd,
    deadline: Instant,
}

/// Min-heap of deadlines with O(log n) access by connection id.
#[derive(Debug)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<RawFd, usize>,
}

impl TimerHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    /// Number of armed entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when no entries are armed.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arms (or re-arms) `id` to expire `timeout` from now.
    pub fn add(&mut self, id: RawFd, timeout: Duration) {
        self.add_at(id, Instant::now() + timeout);
    }

    fn add_at(&mut self, id: RawFd, deadline: Instant) {
        match self.index.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.heap.push(TimerNode { id, deadline });
                self.index.insert(id, i);
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].deadline = deadline;
                if !self.sift_down(i) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Pushes the deadline of an existing entry out to `timeout` from now.
    /// An unknown id is a programmer error and aborts.
    pub fn update(&mut self, id: RawFd, timeout: Duration) {
        let i = self.index[&id];
        self.heap[i].deadline = Instant::now() + timeout;
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    /// Disarms `id` without firing. Unknown ids are ignored.
    pub fn cancel(&mut self, id: RawFd) {
        if let Some(&i) = self.index.get(&id) {
            self.remove_at(i);
        }
    }

    /// Pops every entry whose deadline is at or before `now`, in deadline
    /// order. The caller fires the expiry action for each returned id.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<RawFd> {
        let mut expired = Vec::new();
        while let Some(root) = self.heap.first() {
            if root.deadline > now {
                break;
            }
            expired.push(root.id);
            self.remove_at(0);
        }
        expired
    }

    /// Time until the next deadline, clamped at zero. `None` means no entry
    /// is armed and the caller may block indefinitely.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .first()
            .map(|node| node.deadline.saturating_duration_since(now))
    }

    fn remove_at(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        self.swap_nodes(i, last);
        let node = self.heap.pop().expect("remove on empty heap");
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].deadline <= self.heap[i].deadline {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true when the node actually moved down.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let mut child = i * 2 + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[i].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::TimerHeap;

    fn assert_invariants(timer: &TimerHeap) {
        for (i, node) in timer.heap.iter().enumerate() {
            if i > 0 {
                let parent = &timer.heap[(i - 1) / 2];
                assert!(parent.deadline <= node.deadline, "heap order violated");
            }
            assert_eq!(Some(&i), timer.index.get(&node.id), "index out of sync");
        }
        assert_eq!(timer.heap.len(), timer.index.len());
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn root_is_always_the_minimum() {
        let base = Instant::now();
        let mut timer = TimerHeap::new();
        for (id, offset) in [(5, 50), (1, 10), (9, 90), (3, 30), (7, 70)] {
            timer.add_at(id, base + ms(offset));
            assert_invariants(&timer);
        }
        assert_eq!(Some(ms(10)), timer.next_timeout(base));

        // move the root past everything else
        timer.add_at(1, base + ms(100));
        assert_invariants(&timer);
        assert_eq!(Some(ms(30)), timer.next_timeout(base));

        // pull a leaf in front of everything else
        timer.add_at(9, base + ms(1));
        assert_invariants(&timer);
        assert_eq!(Some(ms(1)), timer.next_timeout(base));
    }

    #[test]
    fn cancel_root_and_only_node() {
        let base = Instant::now();
        let mut timer = TimerHeap::new();
        timer.add_at(42, base + ms(10));
        timer.cancel(42);
        assert!(timer.is_empty());
        assert_eq!(None, timer.next_timeout(base));

        for (id, offset) in [(1, 10), (2, 20), (3, 30)] {
            timer.add_at(id, base + ms(offset));
        }
        timer.cancel(1);
        assert_invariants(&timer);
        assert_eq!(Some(ms(20)), timer.next_timeout(base));
        // cancelling an unknown id is a no-op
        timer.cancel(1);
        assert_eq!(2, timer.len());
    }

    #[test]
    fn equal_deadlines_all_expire() {
        let base = Instant::now();
        let mut timer = TimerHeap::new();
        for id in 0..4 {
            timer.add_at(id, base + ms(5));
        }
        timer.add_at(10, base + ms(50));
        assert_invariants(&timer);

        let mut expired = timer.pop_expired(base + ms(5));
        expired.sort_unstable();
        assert_eq!(vec![0, 1, 2, 3], expired);
        assert_eq!(1, timer.len());
        assert_invariants(&timer);
    }

    #[test]
    fn pop_expired_returns_in_deadline_order() {
        let base = Instant::now();
        let mut timer = TimerHeap::new();
        for (id, offset) in [(4, 40), (2, 20), (1, 10), (3, 30)] {
            timer.add_at(id, base + ms(offset));
        }
        assert_eq!(vec![1, 2, 3], timer.pop_expired(base + ms(30)));
        assert_eq!(vec![4], timer.pop_expired(base + ms(100)));
        assert!(timer.pop_expired(base + ms(100)).is_empty());
        assert!(timer.index.is_empty());
    }

    #[test]
    fn update_pushes_deadline_back() {
        let mut timer = TimerHeap::new();
        timer.add(1, ms(5));
        timer.add(2, ms(1000));
        timer.update(1, ms(2000));
        assert!(timer.pop_expired(Instant::now()).is_empty());
        assert_invariants(&timer);
    }

    #[test]
    fn next_timeout_clamps_at_zero() {
        let base = Instant::now();
        let mut timer = TimerHeap::new();
        timer.add_at(1, base + ms(10));
        assert_eq!(Some(ms(0)), timer.next_timeout(base + ms(50)));
    }

    #[test]
    #[should_panic]
    fn update_of_unknown_id_aborts() {
        let mut timer = TimerHeap::new();
        timer.update(7, ms(10));
    }

    #[test]
    fn interleaved_operations_keep_index_consistent() {
        let base = Instant::now();
        let mut timer = TimerHeap::new();
        for i in 0..32 {
            timer.add_at(i, base + ms(((i * 7) % 13) as u64));
            assert_invariants(&timer);
        }
        for i in (0..32).step_by(3) {
            timer.cancel(i);
            assert_invariants(&timer);
        }
        for i in (1..32).step_by(3) {
            timer.add_at(i, base + ms(((i * 11) % 17) as u64));
            assert_invariants(&timer);
        }
        let drained = timer.pop_expired(base + ms(20));
        assert_eq!(timer.heap.len(), timer.index.len());
        assert!(!drained.is_empty());
        assert_eq!(timer.len() + drained.len(), 32 - 11);
    }
}
