use std::io::{self, Write};

use super::{Mark, Revnum};
use crate::git::fast_import::{self, CommitRef, CVS2SVN_MARKER};

/// Most parents a single commit may have, the implicit one included.
pub const MAX_PARENTS: usize = 16;

/// Changes staged for one branch of one repository in one revision.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub branch: String,
    pub svn_prefix: String,
    pub revision: Revnum,
    deletions: Vec<String>,
    modifications: Vec<u8>,
    merges: Vec<Mark>,
}

/// Header fields of a commit being written.
pub struct CommitHeader<'a> {
    pub mark: Mark,
    pub parent: Mark,
    pub committer: &'a str,
    pub epoch: i64,
    pub message: &'a str,
}

impl Transaction {
    pub fn new(branch: &str, svn_prefix: &str, revision: Revnum) -> Self {
        Self {
            branch: branch.to_string(),
            svn_prefix: svn_prefix.to_string(),
            revision,
            deletions: Vec::new(),
            modifications: Vec::new(),
            merges: Vec::new(),
        }
    }

    /// Stage removal of a file or directory. A trailing slash is dropped;
    /// the empty path stands for the whole tree.
    pub fn delete_file(&mut self, path: &str) {
        let path = path.strip_suffix('/').unwrap_or(path);
        self.deletions.push(path.to_string());
    }

    pub fn deletes_root(&self) -> bool {
        self.deletions.iter().any(String::is_empty)
    }

    pub fn deletions(&self) -> &[String] {
        &self.deletions
    }

    pub fn modify_file(&mut self, mode: u32, mark: Mark, path: &str) -> io::Result<()> {
        fast_import::file_modify(&mut self.modifications, mode, mark, path)
    }

    /// Point the gitlink at `path` to the child's commit `child_mark`.
    pub fn update_submodule(&mut self, child_mark: Mark, path: &str) -> io::Result<()> {
        fast_import::submodule_modify(&mut self.modifications, child_mark, path)
    }

    pub fn modification_count(&self) -> usize {
        self.modifications.iter().filter(|b| **b == b'\n').count()
    }

    /// Returns false when `mark` was already a merge source.
    pub fn add_merge(&mut self, mark: Mark) -> bool {
        if self.merges.contains(&mark) {
            return false;
        }
        self.merges.push(mark);
        true
    }

    /// Merge parents to write given the first parent and the log message.
    fn merge_parents(&self, parent: Mark, message: &str) -> Vec<Mark> {
        if message.contains(CVS2SVN_MARKER) && self.merges.len() > 1 {
            tracing::debug!(
                "discarding all but the highest merge point as a workaround for cvs2svn created branch/tag"
            );
            return self.merges.iter().max().copied().into_iter().collect();
        }

        let mut parents = usize::from(parent != 0);
        let mut selected = Vec::new();
        for &merge in &self.merges {
            if merge == parent {
                tracing::debug!(mark = merge, "skipping merge point matching the parent");
                continue;
            }
            parents += 1;
            if parents > MAX_PARENTS {
                tracing::warn!(
                    branch = %self.branch,
                    revision = self.revision,
                    "too many merge parents; dropping {} of them",
                    self.merges.len() - selected.len()
                );
                break;
            }
            selected.push(merge);
        }
        selected
    }

    /// Write the commit command with its merges, deletions and
    /// modifications. Returns the merge parents written.
    pub fn write_commit<W: Write>(
        &self,
        out: &mut W,
        header: &CommitHeader<'_>,
    ) -> io::Result<Vec<Mark>> {
        fast_import::commit(
            out,
            &self.branch,
            header.mark,
            header.committer,
            header.epoch,
            header.message,
        )?;
        if header.parent != 0 {
            fast_import::from(out, &CommitRef::Mark(header.parent))?;
        }

        let merges = self.merge_parents(header.parent, header.message);
        for merge in &merges {
            fast_import::merge(out, *merge)?;
        }

        if self.deletes_root() {
            fast_import::delete_all(out)?;
        } else {
            for path in &self.deletions {
                fast_import::file_delete(out, path)?;
            }
        }

        out.write_all(&self.modifications)?;
        Ok(merges)
    }
}
