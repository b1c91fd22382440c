use std::collections::BTreeMap;

use super::{Mark, Revnum};
use crate::error::MarkLookupError;

/// State of one ref in a destination repository.
#[derive(Debug, Clone, Default)]
pub struct Branch {
    /// Every pointer move as (revision, mark), in revision order. A deletion
    /// appends mark 0 so ancestry queries keep resolving.
    history: Vec<(Revnum, Mark)>,
    /// `None` until the ref first changes.
    last_change_rev: Option<Revnum>,
    /// Note text attached to the tip; carried into branches made from it.
    pub note: String,
    /// Submodule mount path to child repository name.
    pub submodules: BTreeMap<String, String>,
    pub last_submodule_list_change_rev: Option<Revnum>,
    /// Root tree of the tip as last reported by the importer.
    pub head_tree: Option<String>,
}

impl Branch {
    pub fn exists(&self) -> bool {
        matches!(self.history.last(), Some((_, mark)) if *mark != 0)
    }

    pub fn history(&self) -> &[(Revnum, Mark)] {
        &self.history
    }

    pub fn last_mark(&self) -> Mark {
        self.history.last().map_or(0, |(_, mark)| *mark)
    }

    pub fn last_change_rev(&self) -> Option<Revnum> {
        self.last_change_rev
    }

    pub fn record(&mut self, revision: Revnum, mark: Mark) {
        self.last_change_rev = Some(revision);
        self.history.push((revision, mark));
    }

    /// Record a move found while replaying a previous run's log.
    pub fn replay(&mut self, revision: Revnum, mark: Mark) {
        if !self.exists() || mark == 0 {
            self.last_change_rev = Some(revision);
        }
        self.history.push((revision, mark));
    }

    /// Forget the latest move and return the mark the ref falls back to.
    pub fn discard_last(&mut self) -> Mark {
        self.history.pop();
        self.last_mark()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.last_change_rev = None;
        self.head_tree = None;
    }

    /// Mark of the newest commit at or before `revision`.
    pub fn resolve_mark(&self, name: &str, revision: Revnum) -> Result<Mark, MarkLookupError> {
        let Some(&(last_rev, last_mark)) = self.history.last() else {
            return Err(MarkLookupError::NeverExisted {
                branch: name.to_string(),
            });
        };
        if self.last_change_rev.is_none() {
            return Err(MarkLookupError::NeverExisted {
                branch: name.to_string(),
            });
        }
        if revision == last_rev {
            return Ok(last_mark);
        }

        let upper = self.history.partition_point(|(rev, _)| *rev <= revision);
        if upper == 0 {
            return Err(MarkLookupError::TooEarly {
                branch: name.to_string(),
                revision,
            });
        }
        Ok(self.history[upper - 1].1)
    }
}
