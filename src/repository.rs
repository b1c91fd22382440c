//! Per-destination repository state: branches, staged transactions, mark
//! allocation and the importer they are written to.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use crate::config::ImportOptions;
use crate::error::MarkLookupError;
use crate::git::fast_import::{self, CommitRef, NOTES_REF};
use crate::git::{Backend, DryRunSink, FastImportProcess, ProcessHandle};
use crate::{Error, Result};

mod branch;
mod marks;
mod resume;
mod tags;
mod transaction;

pub use branch::Branch;
pub use marks::{Collision, MarkAllocator, MAX_MARK, NOTES_MARK};
pub use tags::AnnotatedTag;
pub use transaction::{CommitHeader, Transaction, MAX_PARENTS};

pub type Mark = u64;
pub type Revnum = u64;

/// Commit metadata shared by everything written for one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub revision: Revnum,
    pub author: String,
    pub epoch: i64,
    pub message: String,
}

/// Where a repository is mounted as a submodule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperModule {
    pub repo: String,
    pub path: String,
}

/// Revision range a declared ref is expected to change in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefBounds {
    pub min: Revnum,
    pub max: Option<Revnum>,
}

impl RefBounds {
    pub fn contains(&self, revision: Revnum) -> bool {
        revision >= self.min && self.max.map_or(true, |max| revision <= max)
    }
}

/// A ref move waiting for the end of the revision.
#[derive(Debug, Default)]
struct PendingReset {
    backup: Vec<u8>,
    commands: Vec<u8>,
}

pub struct Repository {
    name: String,
    options: Arc<ImportOptions>,
    super_module: Option<SuperModule>,
    has_submodules: bool,
    declared: BTreeMap<String, RefBounds>,
    branches: BTreeMap<String, Branch>,
    transactions: BTreeMap<String, Transaction>,
    annotated_tags: BTreeMap<String, AnnotatedTag>,
    deleted_branches: BTreeMap<String, PendingReset>,
    reset_branches: BTreeMap<String, PendingReset>,
    modified_refs: BTreeSet<String>,
    pending_submodule_refs: usize,
    marks: MarkAllocator,
    commit_count: u64,
    process: ProcessHandle,
    preloaded: Option<Backend>,
}

fn file_stem(name: &str) -> String {
    name.replace('/', "_")
}

fn collision(repo: &str, c: Collision) -> Error {
    Error::MarkCollision {
        repo: repo.to_string(),
        commit_mark: c.commit_mark,
        file_mark: c.file_mark,
    }
}

fn backup_ref(ref_name: &str, revision: Revnum, deleting: bool) -> String {
    match ref_name.strip_prefix("refs/heads/") {
        Some(branch) if deleting => format!("refs/tags/backups/{branch}@{revision}"),
        _ => format!(
            "refs/backups/r{revision}{}",
            ref_name.strip_prefix("refs").unwrap_or(ref_name)
        ),
    }
}

/// `.gitmodules` text for mount path to child repository pairs.
fn gitmodules_manifest(submodules: &BTreeMap<String, String>, url_base: &str) -> String {
    let mut content = String::new();
    for (path, child) in submodules {
        content.push_str(&format!(
            "[submodule \"{path}\"]\n\tpath = {path}\n\turl = {url_base}{child}\n"
        ));
    }
    content
}

impl Repository {
    /// Set up the repository and, outside dry runs, create it on disk if
    /// needed. `declared` refs start out known but never changed.
    pub fn new(
        name: &str,
        options: Arc<ImportOptions>,
        declared: BTreeMap<String, RefBounds>,
    ) -> Result<Self> {
        let mut branches: BTreeMap<String, Branch> = declared
            .keys()
            .map(|name| (name.clone(), Branch::default()))
            .collect();
        branches.entry(options.default_branch.clone()).or_default();

        let repo = Self {
            name: name.to_string(),
            super_module: None,
            has_submodules: false,
            declared,
            branches,
            transactions: BTreeMap::new(),
            annotated_tags: BTreeMap::new(),
            deleted_branches: BTreeMap::new(),
            reset_branches: BTreeMap::new(),
            modified_refs: BTreeSet::new(),
            pending_submodule_refs: 0,
            marks: MarkAllocator::default(),
            commit_count: 0,
            process: ProcessHandle::new(name),
            preloaded: None,
            options,
        };

        fs::create_dir_all(&repo.options.output_dir)?;
        if !repo.options.dry_run {
            repo.ensure_existence()?;
        }
        Ok(repo)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn git_dir(&self) -> PathBuf {
        self.options.output_dir.join(&self.name)
    }

    pub fn marks_file_name(&self) -> String {
        format!("marks-{}", file_stem(&self.name))
    }

    pub fn marks_path(&self) -> PathBuf {
        self.git_dir().join(self.marks_file_name())
    }

    pub fn log_path(&self) -> PathBuf {
        self.options
            .output_dir
            .join(format!("log-{}", file_stem(&self.name)))
    }

    /// Create the bare repository and an empty marks file unless the
    /// directory already exists. Returns whether it was created.
    fn ensure_existence(&self) -> Result<bool> {
        let git_dir = self.git_dir();
        if git_dir.exists() {
            return Ok(false);
        }

        tracing::info!(repo = %self.name, "creating new repository at {}", git_dir.display());
        fs::create_dir_all(&git_dir)?;
        let status = Command::new(&self.options.git)
            .args(["init", "--bare", "--quiet"])
            .current_dir(&git_dir)
            .status()
            .map_err(|source| Error::ProcessStart {
                repo: self.name.clone(),
                source,
            })?;
        if !status.success() {
            return Err(Error::ProcessStart {
                repo: self.name.clone(),
                source: std::io::Error::other(format!("git init exited with {status}")),
            });
        }
        fs::write(self.marks_path(), "")?;
        Ok(true)
    }

    pub fn super_module(&self) -> Option<&SuperModule> {
        self.super_module.as_ref()
    }

    /// Declare where this repository is mounted. Declaring a different
    /// parent or path than before is a configuration error.
    pub fn set_super_module(&mut self, super_module: SuperModule) -> Result<()> {
        if let Some(existing) = &self.super_module {
            if existing.repo != super_module.repo {
                return Err(Error::ConflictingSuperModule {
                    repo: self.name.clone(),
                    first: existing.repo.clone(),
                    second: super_module.repo,
                });
            }
            if existing.path != super_module.path {
                return Err(Error::ConflictingSubmodulePath {
                    repo: self.name.clone(),
                    first: existing.path.clone(),
                    second: super_module.path,
                });
            }
        }
        self.super_module = Some(super_module);
        Ok(())
    }

    pub fn set_has_submodules(&mut self) {
        self.has_submodules = true;
    }

    pub fn has_submodules(&self) -> bool {
        self.has_submodules
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.get(name)
    }

    pub fn branches(&self) -> &BTreeMap<String, Branch> {
        &self.branches
    }

    /// The branch named `name`, created as never changed if unknown.
    pub fn branch_ref(&mut self, name: &str) -> &mut Branch {
        self.branches.entry(name.to_string()).or_default()
    }

    pub fn last_commit_mark(&self) -> Mark {
        self.marks.last_commit_mark()
    }

    /// Warn when a declared ref changes outside its revision range.
    pub fn check_bounds(&self, ref_name: &str, revision: Revnum) {
        if let Some(bounds) = self.declared.get(ref_name) {
            if !bounds.contains(revision) {
                tracing::warn!(
                    repo = %self.name,
                    "{ref_name} changes in r{revision}, outside its declared range {}..{}",
                    bounds.min,
                    bounds.max.map(|max| max.to_string()).unwrap_or_default()
                );
            }
        }
    }

    /// Use `backend` the next time the importer starts instead of spawning
    /// one.
    pub fn set_backend(&mut self, backend: Backend) {
        self.preloaded = Some(backend);
    }

    /// Start the importer unless it is running. A restarted importer gets
    /// every live branch re-pointed at its last mark.
    pub fn start_process(&mut self) -> Result<()> {
        if !self.process.needs_start()? {
            return Ok(());
        }

        let backend = match self.preloaded.take() {
            Some(backend) => backend,
            None if self.options.dry_run => Backend::DryRun(
                DryRunSink::to_file(&self.log_path()).map_err(|source| Error::ProcessStart {
                    repo: self.name.clone(),
                    source,
                })?,
            ),
            None => Backend::Process(
                FastImportProcess::spawn(
                    &self.options.git,
                    &self.git_dir(),
                    &self.marks_file_name(),
                    &self.log_path(),
                )
                .map_err(|source| Error::ProcessStart {
                    repo: self.name.clone(),
                    source,
                })?,
            ),
        };
        tracing::debug!(repo = %self.name, "starting git-fast-import");
        self.process.attach(backend);
        self.reload_branches()
    }

    fn reload_branches(&mut self) -> Result<()> {
        let query_trees = self.process.answers_queries();
        let mut out = Vec::new();
        let mut queried = Vec::new();
        let mut reset_notes = false;
        for (name, branch) in &self.branches {
            if !branch.exists() {
                continue;
            }
            reset_notes = true;
            fast_import::reset(&mut out, name, &CommitRef::Mark(branch.last_mark()))?;
            fast_import::progress(&mut out, &format!("Branch {name} reloaded"))?;
            // replayed branches have no tree to compare the next commit with
            if query_trees && branch.head_tree.is_none() {
                fast_import::ls_commit_root(&mut out, branch.last_mark())?;
                queried.push(name.clone());
            }
        }
        if reset_notes && self.options.add_metadata_notes {
            fast_import::reset(&mut out, NOTES_REF, &CommitRef::Mark(NOTES_MARK))?;
        }
        if out.is_empty() {
            return Ok(());
        }
        self.process.write(&out)?;
        if queried.is_empty() {
            return Ok(());
        }

        self.process.flush()?;
        for name in queried {
            let response = self.process.read_response()?;
            let tree = response
                .as_deref()
                .and_then(fast_import::parse_ls_root_response);
            if tree.is_none() {
                tracing::warn!(
                    repo = %self.name,
                    "unrecognized response {:?} from ls of reloaded {name}",
                    response.unwrap_or_default()
                );
            }
            if let Some(branch) = self.branches.get_mut(&name) {
                branch.head_tree = tree;
            }
        }
        Ok(())
    }

    /// Checkpoint and stop the importer. It is started again on demand.
    pub fn close_process(&mut self) -> Result<()> {
        if self.process.is_running() {
            tracing::debug!(repo = %self.name, "closing git-fast-import");
        }
        self.process.close()
    }

    fn mark_from(
        &self,
        branch_from: &str,
        revision: Revnum,
    ) -> std::result::Result<Mark, MarkLookupError> {
        match self.branches.get(branch_from) {
            Some(branch) => branch.resolve_mark(branch_from, revision),
            None => Err(MarkLookupError::NeverExisted {
                branch: branch_from.to_string(),
            }),
        }
    }

    /// Record a pointer move of `ref_name` to `mark` (0 deletes it), written
    /// at the end of the revision.
    ///
    /// A create following a delete of the same ref in one revision replaces
    /// the delete and keeps its backup. A delete following a create drops
    /// both.
    pub fn reset_branch(
        &mut self,
        ref_name: &str,
        revision: Revnum,
        mark: Mark,
        reset_to: &CommitRef,
        comment: &str,
    ) -> Result<()> {
        let deleting = mark == 0;
        let branch = self.branches.entry(ref_name.to_string()).or_default();

        let mut backup = Vec::new();
        if branch.exists() && branch.last_change_rev() != Some(revision) {
            let backup_name = backup_ref(ref_name, revision, deleting);
            tracing::debug!(repo = %self.name, "backing up branch {ref_name} to {backup_name}");
            fast_import::reset(&mut backup, &backup_name, &CommitRef::Ref(ref_name.to_string()))?;
        }

        branch.record(revision, mark);
        branch.head_tree = None;

        let mut commands = Vec::new();
        fast_import::reset(&mut commands, ref_name, reset_to)?;
        fast_import::progress(
            &mut commands,
            &fast_import::progress_record(revision, ref_name, mark, comment),
        )?;

        if deleting {
            if self.reset_branches.remove(ref_name).is_some() {
                tracing::debug!(
                    repo = %self.name,
                    "{ref_name} created and deleted in r{revision}; dropping both"
                );
            } else {
                let pending = self.deleted_branches.entry(ref_name.to_string()).or_default();
                pending.backup.extend(backup);
                pending.commands.extend(commands);
            }
        } else {
            let cancelled = self.deleted_branches.remove(ref_name);
            let pending = self.reset_branches.entry(ref_name.to_string()).or_default();
            if let Some(deleted) = cancelled {
                tracing::debug!(
                    repo = %self.name,
                    "{ref_name} deleted and re-created in r{revision}; dropping the delete"
                );
                pending.backup.extend(deleted.backup);
            }
            pending.backup.extend(backup);
            pending.commands.extend(commands);
        }
        Ok(())
    }

    /// Point `ref_name` at the newest commit of `branch_from` at or before
    /// `from_revision`, carrying over its note.
    pub fn create_branch(
        &mut self,
        ref_name: &str,
        revision: Revnum,
        branch_from: &str,
        from_revision: Revnum,
    ) -> Result<()> {
        let mut desc = format!("from branch {branch_from} at r{from_revision}");
        let mark = match self.mark_from(branch_from, from_revision) {
            Ok(mark) => mark,
            Err(MarkLookupError::NeverExisted { .. }) => {
                return Err(Error::BranchSourceMissing {
                    repo: self.name.clone(),
                    branch: ref_name.to_string(),
                    source_branch: branch_from.to_string(),
                });
            }
            Err(e @ MarkLookupError::TooEarly { .. }) => {
                tracing::warn!(repo = %self.name, "{e}");
                0
            }
        };

        let reset_to = if mark == 0 {
            tracing::warn!(
                repo = %self.name,
                "{ref_name} is branching but no exported commits exist in repository; creating an empty branch"
            );
            desc.push_str(", deleted/unknown");
            CommitRef::Ref(branch_from.to_string())
        } else {
            CommitRef::Mark(mark)
        };
        tracing::debug!(repo = %self.name, "creating branch {ref_name} {desc}");

        let note = self
            .branches
            .get(branch_from)
            .map(|b| b.note.clone())
            .unwrap_or_default();
        self.branch_ref(ref_name).note = note;
        self.reset_branch(ref_name, revision, mark, &reset_to, &desc)
    }

    /// Delete `ref_name`. The default branch is never deleted.
    pub fn delete_branch(&mut self, ref_name: &str, revision: Revnum) -> Result<()> {
        if ref_name == self.options.default_branch {
            tracing::debug!(repo = %self.name, "not deleting default branch {ref_name}");
            return Ok(());
        }
        self.reset_branch(ref_name, revision, 0, &CommitRef::Null, "delete")
    }

    /// The open transaction for `branch`, started if there is none yet.
    pub fn demand_transaction(
        &mut self,
        branch: &str,
        svn_prefix: &str,
        revision: Revnum,
    ) -> Result<&mut Transaction> {
        if !self.transactions.contains_key(branch) {
            if !self.branches.contains_key(branch) {
                tracing::debug!(repo = %self.name, "creating branch {branch}");
            }
            self.commit_count += 1;
            let interval = self.options.commit_interval;
            if interval > 0 && self.commit_count % interval == 0 {
                let mut out = Vec::new();
                fast_import::checkpoint(&mut out)?;
                self.process.write(&out)?;
                tracing::debug!(
                    repo = %self.name,
                    "checkpoint after {} commits",
                    self.commit_count
                );
            }
        }
        Ok(self
            .transactions
            .entry(branch.to_string())
            .or_insert_with(|| Transaction::new(branch, svn_prefix, revision)))
    }

    /// Stage a file write. The blob goes to the importer right away; the
    /// tree entry waits for the commit.
    pub fn add_file(
        &mut self,
        branch: &str,
        svn_prefix: &str,
        revision: Revnum,
        path: &str,
        mode: u32,
        data: &[u8],
    ) -> Result<()> {
        let mark = self
            .marks
            .next_file_mark()
            .map_err(|c| collision(&self.name, c))?;
        if !self.options.dry_run {
            let mut out = Vec::with_capacity(data.len() + 32);
            fast_import::blob(&mut out, mark, data)?;
            self.process.write(&out)?;
        }
        self.demand_transaction(branch, svn_prefix, revision)?
            .modify_file(mode, mark, path)?;
        Ok(())
    }

    pub fn delete_path(
        &mut self,
        branch: &str,
        svn_prefix: &str,
        revision: Revnum,
        path: &str,
    ) -> Result<()> {
        self.demand_transaction(branch, svn_prefix, revision)?
            .delete_file(path);
        Ok(())
    }

    /// Record that `branch` received files copied from `branch_from` at
    /// `from_revision`, making that commit a merge parent.
    pub fn note_copy_from_branch(
        &mut self,
        branch: &str,
        svn_prefix: &str,
        revision: Revnum,
        branch_from: &str,
        from_revision: Revnum,
    ) -> Result<()> {
        if branch == branch_from {
            tracing::warn!(repo = %self.name, "cannot merge inside a branch ({branch})");
            return Ok(());
        }

        let resolved = self.mark_from(branch_from, from_revision);
        let name = self.name.clone();
        let txn = self.demand_transaction(branch, svn_prefix, revision)?;
        match resolved {
            Err(MarkLookupError::NeverExisted { .. }) => {
                tracing::warn!(
                    repo = %name,
                    "{branch} is copying from branch {branch_from} but the latter doesn't exist; continuing, assuming the files exist"
                );
            }
            Err(MarkLookupError::TooEarly { .. }) | Ok(0) => {
                tracing::warn!(
                    repo = %name,
                    "unknown revision r{from_revision} of {branch_from}; continuing, assuming the files exist"
                );
            }
            Ok(mark) => {
                if txn.add_merge(mark) {
                    tracing::debug!(
                        repo = %name,
                        "adding {branch_from}@{from_revision} : {mark} as a merge point of {branch}"
                    );
                } else {
                    tracing::debug!(repo = %name, "merge point {mark} already recorded");
                }
            }
        }
        Ok(())
    }

    /// Mark `ref_name` as changing in the current revision. Returns false if
    /// it already was.
    pub fn mark_modified(&mut self, ref_name: &str) -> bool {
        let inserted = self.modified_refs.insert(ref_name.to_string());
        if inserted {
            tracing::trace!(repo = %self.name, "marking {ref_name} for modification");
        }
        inserted
    }

    pub fn add_pending_submodule_ref(&mut self) {
        self.pending_submodule_refs += 1;
    }

    pub fn pending_submodule_refs(&self) -> usize {
        self.pending_submodule_refs
    }

    /// Whether closing must wait for submodules: while changes are still
    /// being discovered, or while a child has refs left to report.
    pub fn defer_close(&self, discovering: bool) -> bool {
        self.has_submodules && (discovering || self.pending_submodule_refs != 0)
    }

    pub fn has_pending_work(&self) -> bool {
        !self.modified_refs.is_empty()
            || !self.transactions.is_empty()
            || !self.deleted_branches.is_empty()
            || !self.reset_branches.is_empty()
    }

    /// A child reported the new tip of `ref_name`; 0 means the child branch
    /// is gone. Stages the gitlink change and settles one pending report.
    pub fn submodule_changed(
        &mut self,
        child: &str,
        path: &str,
        ref_name: &str,
        child_mark: Mark,
        revision: Revnum,
    ) -> Result<()> {
        self.pending_submodule_refs = self.pending_submodule_refs.saturating_sub(1);
        let deletion = child_mark == 0;

        let branch = self.branch_ref(ref_name);
        if deletion {
            if branch.submodules.remove(path).is_none() {
                return Ok(());
            }
            branch.last_submodule_list_change_rev = Some(revision);
        } else if branch.submodules.get(path).map(String::as_str) != Some(child) {
            branch.submodules.insert(path.to_string(), child.to_string());
            branch.last_submodule_list_change_rev = Some(revision);
        }

        if deletion {
            tracing::debug!(
                repo = %self.name,
                "submodule {path} deleted in {ref_name} of r{revision}"
            );
        } else {
            tracing::debug!(
                repo = %self.name,
                "submodule {path} updated to mark :{child_mark} in {ref_name} of r{revision}"
            );
        }

        let txn = self.demand_transaction(ref_name, "", revision)?;
        if deletion {
            txn.delete_file(path);
        } else {
            txn.update_submodule(child_mark, path)?;
        }
        Ok(())
    }

    /// Rewrite `.gitmodules` of `branch` from its submodule set.
    fn update_dot_gitmodules(&mut self, branch: &str, revision: Revnum) -> Result<()> {
        let submodules = self
            .branches
            .get(branch)
            .map(|b| b.submodules.clone())
            .unwrap_or_default();
        if submodules.is_empty() {
            return self.delete_path(branch, "", revision, ".gitmodules");
        }

        let content = gitmodules_manifest(&submodules, &self.options.submodule_url_base);
        self.add_file(branch, "", revision, ".gitmodules", 0o100644, content.as_bytes())
    }

    fn prepare_commit(&mut self, revision: Revnum) -> Result<()> {
        let manifests: Vec<String> = self
            .branches
            .iter()
            .filter(|(name, b)| {
                b.last_submodule_list_change_rev == Some(revision)
                    || (self.has_submodules
                        && !b.submodules.is_empty()
                        && self
                            .transactions
                            .get(*name)
                            .is_some_and(Transaction::deletes_root))
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in manifests {
            self.update_dot_gitmodules(&name, revision)?;
        }

        if self.deleted_branches.is_empty() && self.reset_branches.is_empty() {
            return Ok(());
        }
        let deleted = std::mem::take(&mut self.deleted_branches);
        let reset = std::mem::take(&mut self.reset_branches);
        let mut out = Vec::new();
        for pending in deleted.into_values().chain(reset.into_values()) {
            out.extend(pending.backup);
            out.extend(pending.commands);
        }
        self.process.write(&out)
    }

    /// Write every ref move and commit staged in this revision. Returns the
    /// new tip of every modified ref when this repository is a submodule.
    pub fn close_revision(&mut self, info: &RevisionInfo) -> Result<Vec<(String, Mark)>> {
        self.prepare_commit(info.revision)?;

        let transactions = std::mem::take(&mut self.transactions);
        for txn in transactions.into_values() {
            self.commit(txn, info)?;
        }
        self.marks.reset_file_marks();

        let refs = std::mem::take(&mut self.modified_refs);
        if self.super_module.is_none() {
            return Ok(Vec::new());
        }
        Ok(refs
            .into_iter()
            .map(|name| {
                let mark = self.branches.get(&name).map_or(0, Branch::last_mark);
                (name, mark)
            })
            .collect())
    }

    fn commit(&mut self, txn: Transaction, info: &RevisionInfo) -> Result<()> {
        let mark = self
            .marks
            .next_commit_mark()
            .map_err(|c| collision(&self.name, c))?;

        let mut message = info.message.clone();
        if !message.ends_with('\n') {
            message.push('\n');
        }
        if self.options.add_metadata {
            message.push('\n');
            message.push_str(&fast_import::metadata_message(&txn.svn_prefix, txn.revision, ""));
        }

        let branch = self.branches.entry(txn.branch.clone()).or_default();
        let parent = if branch.exists() {
            branch.last_mark()
        } else {
            if self.options.incremental {
                tracing::warn!(
                    repo = %self.name,
                    "branch {} doesn't exist at revision {} -- did you resume from the wrong revision?",
                    txn.branch,
                    txn.revision
                );
            }
            0
        };
        branch.record(txn.revision, mark);

        let header = CommitHeader {
            mark,
            parent,
            committer: &info.author,
            epoch: info.epoch,
            message: &message,
        };
        let mut out = Vec::new();
        let merges = txn.write_commit(&mut out, &header)?;

        let query_tree = self.process.answers_queries();
        if query_tree {
            fast_import::ls_root(&mut out)?;
        }
        let comment = if merges.is_empty() {
            String::new()
        } else {
            let marks: Vec<String> = merges.iter().map(|m| format!(":{m}")).collect();
            format!("merge from {}", marks.join(" "))
        };
        fast_import::progress(
            &mut out,
            &fast_import::progress_record(txn.revision, &txn.branch, mark, &comment),
        )?;
        self.process.write(&out)?;
        tracing::trace!(
            repo = %self.name,
            "{} modifications from SVN {} to {}",
            txn.deletions().len() + txn.modification_count(),
            txn.svn_prefix,
            txn.branch
        );

        let retained = if query_tree {
            self.close_tree(&txn.branch, txn.revision)?
        } else {
            true
        };

        if retained && self.options.add_metadata_notes {
            let text = fast_import::metadata_message(&txn.svn_prefix, txn.revision, "");
            self.commit_note(&txn.branch, &text, false, &info.author, info.epoch)?;
        }
        self.process.flush()
    }

    /// Read the root tree of the commit just written. A commit that leaves
    /// the tree as it was is dropped and the ref rewound, merges or not.
    /// Returns whether the commit was kept.
    fn close_tree(&mut self, ref_name: &str, revision: Revnum) -> Result<bool> {
        let response = self.process.read_response()?;
        let tree = response
            .as_deref()
            .and_then(fast_import::parse_ls_root_response);

        let branch = self.branches.entry(ref_name.to_string()).or_default();
        let Some(tree) = tree else {
            tracing::warn!(
                repo = %self.name,
                "unrecognized response {:?} from ls in ref {ref_name}",
                response.unwrap_or_default()
            );
            branch.head_tree = None;
            return Ok(true);
        };
        tracing::trace!(repo = %self.name, "new tree of {ref_name}: {tree}");

        let unchanged = branch.head_tree.as_deref() == Some(tree.as_str());
        if !(unchanged && branch.history().len() >= 2) {
            branch.head_tree = Some(tree);
            return Ok(true);
        }

        let previous = branch.discard_last();
        tracing::debug!(
            repo = %self.name,
            "tree of {ref_name} unchanged in r{revision}; resetting ref to :{previous}"
        );
        let target = if previous == 0 {
            CommitRef::Null
        } else {
            CommitRef::Mark(previous)
        };
        let mut out = Vec::new();
        fast_import::reset(&mut out, ref_name, &target)?;
        fast_import::progress(
            &mut out,
            &fast_import::progress_record(revision, ref_name, previous, "unchanged tree"),
        )?;
        self.process.write(&out)?;
        Ok(false)
    }

    /// Attach `text` as a note to the tip of `branch`. With `append` the
    /// branch's existing note text comes first.
    fn commit_note(
        &mut self,
        branch: &str,
        text: &str,
        append: bool,
        author: &str,
        epoch: i64,
    ) -> Result<()> {
        let mut message = format!("Adding Git note for current {branch}\n");
        let mut text = text.to_string();
        if append {
            if let Some(existing) = self.branches.get(branch).filter(|b| !b.note.is_empty()) {
                text = format!("{}{text}", existing.note);
                message = format!("Appending Git note for current {branch}\n");
            }
        }

        let mut out = Vec::new();
        fast_import::note(&mut out, NOTES_MARK, author, epoch, &message, branch, &text)?;
        self.process.write(&out)?;

        if let Some(b) = self.branches.get_mut(branch) {
            b.note = text;
        }
        Ok(())
    }
}
