use super::Mark;

/// Highest file mark. Some git-fast-import versions misbehave on larger
/// values.
pub const MAX_MARK: Mark = (1 << 20) - 2;

/// Mark reserved for commits on the notes ref.
pub const NOTES_MARK: Mark = MAX_MARK + 1;

/// The two counters would have met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collision {
    pub commit_mark: Mark,
    pub file_mark: Mark,
}

/// Hands out commit marks upward from 1 and file marks downward from the
/// ceiling. File marks start over at the ceiling once a revision's commits
/// are written, so only commit marks accumulate across the run.
#[derive(Debug, Clone)]
pub struct MarkAllocator {
    ceiling: Mark,
    last_commit_mark: Mark,
    next_file_mark: Mark,
}

impl Default for MarkAllocator {
    fn default() -> Self {
        Self::with_ceiling(MAX_MARK)
    }
}

impl MarkAllocator {
    pub fn with_ceiling(ceiling: Mark) -> Self {
        Self {
            ceiling,
            last_commit_mark: 0,
            next_file_mark: ceiling,
        }
    }

    pub fn last_commit_mark(&self) -> Mark {
        self.last_commit_mark
    }

    pub fn next_commit_mark(&mut self) -> Result<Mark, Collision> {
        let mark = self.last_commit_mark + 1;
        if mark + 1 >= self.next_file_mark {
            return Err(Collision {
                commit_mark: mark,
                file_mark: self.next_file_mark,
            });
        }
        self.last_commit_mark = mark;
        Ok(mark)
    }

    pub fn next_file_mark(&mut self) -> Result<Mark, Collision> {
        let mark = self.next_file_mark;
        if mark <= self.last_commit_mark + 1 {
            return Err(Collision {
                commit_mark: self.last_commit_mark,
                file_mark: mark,
            });
        }
        self.next_file_mark = mark - 1;
        Ok(mark)
    }

    pub fn reset_file_marks(&mut self) {
        self.next_file_mark = self.ceiling;
    }

    /// Account for a commit mark found in a previous run's log.
    pub fn observe_commit_mark(&mut self, mark: Mark) {
        self.last_commit_mark = self.last_commit_mark.max(mark);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_counters_move_apart() {
        let mut marks = MarkAllocator::default();
        assert_eq!(marks.next_commit_mark(), Ok(1));
        assert_eq!(marks.next_commit_mark(), Ok(2));
        assert_eq!(marks.next_file_mark(), Ok(MAX_MARK));
        assert_eq!(marks.next_file_mark(), Ok(MAX_MARK - 1));
        marks.reset_file_marks();
        assert_eq!(marks.next_file_mark(), Ok(MAX_MARK));
        assert_eq!(NOTES_MARK, MAX_MARK + 1);
    }

    #[test]
    fn test_collision_is_reported() {
        let mut marks = MarkAllocator::with_ceiling(6);
        assert_eq!(marks.next_commit_mark(), Ok(1));
        assert_eq!(marks.next_file_mark(), Ok(6));
        assert_eq!(marks.next_file_mark(), Ok(5));
        assert_eq!(marks.next_commit_mark(), Ok(2));
        assert_eq!(marks.next_file_mark(), Ok(4));
        assert!(marks.next_file_mark().is_err());
        assert!(marks.next_commit_mark().is_err());
        assert_eq!(marks.last_commit_mark(), 2);
    }

    #[test]
    fn test_observe_only_raises() {
        let mut marks = MarkAllocator::default();
        marks.observe_commit_mark(7);
        marks.observe_commit_mark(3);
        assert_eq!(marks.next_commit_mark(), Ok(8));
    }

    proptest! {
        #[test]
        fn prop_ranges_never_intersect(
            ceiling in 8u64..400,
            revisions in prop::collection::vec((0usize..6, 0usize..120), 1..40),
        ) {
            let mut marks = MarkAllocator::with_ceiling(ceiling);
            let mut commit_marks: Vec<Mark> = Vec::new();

            'run: for (commits, files) in revisions {
                let mut file_marks: Vec<Mark> = Vec::new();
                for _ in 0..files {
                    match marks.next_file_mark() {
                        Ok(mark) => file_marks.push(mark),
                        Err(_) => break 'run,
                    }
                }
                for _ in 0..commits {
                    match marks.next_commit_mark() {
                        Ok(mark) => commit_marks.push(mark),
                        Err(_) => break 'run,
                    }
                }
                prop_assert!(file_marks.windows(2).all(|w| w[0] > w[1]));
                prop_assert!(file_marks.iter().all(|m| *m <= ceiling));
                for mark in &file_marks {
                    prop_assert!(commit_marks.iter().all(|c| c < mark));
                }
                let files: BTreeSet<Mark> = file_marks.into_iter().collect();
                prop_assert!(commit_marks.iter().all(|c| !files.contains(c)));
                marks.reset_file_marks();
            }

            prop_assert!(commit_marks.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
