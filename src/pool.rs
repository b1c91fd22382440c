use std::collections::VecDeque;

/// Bounded set of repositories with a live importer, least recently used
/// first.
#[derive(Debug)]
pub struct ProcessPool {
    capacity: usize,
    order: VecDeque<String>,
}

impl ProcessPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
        }
    }

    /// Make `repo` the most recently used entry. Returns the repositories
    /// evicted to make room; their importers must be closed.
    pub fn touch(&mut self, repo: &str) -> Vec<String> {
        if self.order.back().is_some_and(|last| last == repo) {
            return Vec::new();
        }
        self.remove(repo);

        let mut evicted = Vec::new();
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(name) => evicted.push(name),
                None => break,
            }
        }
        self.order.push_back(repo.to_string());
        evicted
    }

    pub fn remove(&mut self, repo: &str) {
        self.order.retain(|name| name != repo);
    }
}
