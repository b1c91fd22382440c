//! All destination repositories of a run and the per-revision protocol
//! between them.
//!
//! Operations of a revision are applied between [`Registry::begin_revision`]
//! and [`Registry::end_revision`]. Touching a ref of a submodule repository
//! also marks the same ref of its parent as changing, and the parent does
//! not write its commits until every child has reported the new tip of each
//! ref it touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ImportOptions, RulesConfig};
use crate::pool::ProcessPool;
use crate::repository::{Mark, RefBounds, Repository, RevisionInfo, Revnum, SuperModule};
use crate::{Error, Result};

pub struct Registry {
    repositories: BTreeMap<String, Repository>,
    pool: ProcessPool,
    revision: Option<RevisionInfo>,
    last_revision: Option<Revnum>,
    discovering: bool,
}

impl Registry {
    /// Build every repository the rules declare and link submodules to their
    /// parents.
    pub fn from_config(rules: &RulesConfig, options: ImportOptions) -> Result<Self> {
        let options = Arc::new(options);

        let mut declared: BTreeMap<&str, BTreeMap<String, RefBounds>> = BTreeMap::new();
        for rule in &rules.repositories {
            let refs = declared.entry(rule.name.as_str()).or_default();
            for r in rule.branches.iter().chain(&rule.tags) {
                refs.insert(
                    r.name.clone(),
                    RefBounds {
                        min: r.min,
                        max: r.max,
                    },
                );
            }
        }

        let mut repositories = BTreeMap::new();
        for (name, refs) in declared {
            let repo = Repository::new(name, Arc::clone(&options), refs)?;
            repositories.insert(name.to_string(), repo);
        }

        for rule in &rules.repositories {
            let Some(parent) = &rule.submodule_of else {
                continue;
            };
            if !repositories.contains_key(parent) {
                return Err(Error::UnknownRepository {
                    name: parent.clone(),
                });
            }
            let super_module = SuperModule {
                repo: parent.clone(),
                path: rule.mount_path().to_string(),
            };
            if let Some(child) = repositories.get_mut(&rule.name) {
                child.set_super_module(super_module)?;
            }
            if let Some(parent) = repositories.get_mut(parent) {
                parent.set_has_submodules();
            }
        }

        let registry = Self {
            pool: ProcessPool::new(options.max_processes),
            repositories,
            revision: None,
            last_revision: None,
            discovering: false,
        };
        registry.check_cycles()?;
        Ok(registry)
    }

    fn check_cycles(&self) -> Result<()> {
        for name in self.repositories.keys() {
            let mut chain = vec![name.clone()];
            let mut current = name;
            while let Some(parent) = self
                .repositories
                .get(current)
                .and_then(Repository::super_module)
            {
                if parent.repo == *name {
                    return Err(Error::SubmoduleCycle {
                        repo: name.clone(),
                        chain,
                    });
                }
                if chain.contains(&parent.repo) {
                    // a cycle not through `name`; reported from its members
                    break;
                }
                chain.push(parent.repo.clone());
                current = &parent.repo;
            }
        }
        Ok(())
    }

    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }

    pub fn repository_mut(&mut self, name: &str) -> Option<&mut Repository> {
        self.repositories.get_mut(name)
    }

    fn repo_mut(&mut self, name: &str) -> Result<&mut Repository> {
        self.repositories
            .get_mut(name)
            .ok_or_else(|| Error::UnknownRepository {
                name: name.to_string(),
            })
    }

    /// Rebuild branch state from the logs of a previous run. Returns the
    /// first revision still to import.
    ///
    /// When one repository has to rewind below what the others already
    /// replayed, every log is restored and replay starts over with the
    /// lower cutoff.
    pub fn setup_incremental(&mut self, resume_from: Option<Revnum>) -> Result<Revnum> {
        let mut cutoff = resume_from.unwrap_or(Revnum::MAX);
        let names: Vec<String> = self.repositories.keys().cloned().collect();

        'retry: loop {
            let mut next_revision = 1;
            for (idx, name) in names.iter().enumerate() {
                let before = cutoff;
                let repo_next = self.repo_mut(name)?.setup_incremental(&mut cutoff)?;

                if let Some(resume_from) = resume_from {
                    if cutoff < resume_from {
                        return Err(Error::CannotResume {
                            resume_from,
                            revision: cutoff,
                        });
                    }
                }

                if cutoff < before && idx > 0 {
                    tracing::info!("rewinding every repository to r{cutoff}");
                    for name in &names {
                        let repo = self.repo_mut(name)?;
                        repo.restore_log()?;
                        repo.forget_history();
                    }
                    continue 'retry;
                }
                next_revision = next_revision.max(repo_next);
            }

            let next = resume_from.unwrap_or(next_revision);
            tracing::info!("resuming at r{next}");
            return Ok(next);
        }
    }

    fn current(&self) -> Result<&RevisionInfo> {
        self.revision
            .as_ref()
            .ok_or_else(|| Error::Input("change outside of a revision".to_string()))
    }

    /// Start collecting the changes of `info.revision`.
    pub fn begin_revision(&mut self, info: RevisionInfo) -> Result<()> {
        if let Some(previous) = self.last_revision {
            if info.revision <= previous {
                return Err(Error::OutOfOrderRevision {
                    previous,
                    revision: info.revision,
                });
            }
        }
        if let Some(open) = &self.revision {
            return Err(Error::Input(format!(
                "r{} started while r{} is still open",
                info.revision, open.revision
            )));
        }
        tracing::debug!("importing r{}", info.revision);
        self.last_revision = Some(info.revision);
        self.revision = Some(info);
        self.discovering = true;
        Ok(())
    }

    /// Start the importer of `name` if needed, closing whatever the pool
    /// evicts to make room.
    fn touch(&mut self, name: &str) -> Result<()> {
        for evicted in self.pool.touch(name) {
            if let Some(repo) = self.repositories.get_mut(&evicted) {
                repo.close_process()?;
            }
        }
        self.repo_mut(name)?.start_process()
    }

    /// Mark `ref_name` as changing in `repo` and, while changes are still
    /// being discovered, in every repository above it.
    fn mark_modified(&mut self, repo: &str, ref_name: &str) -> Result<()> {
        let mut current = repo.to_string();
        loop {
            let discovering = self.discovering;
            let repository = self.repo_mut(&current)?;
            if !repository.mark_modified(ref_name) || !discovering {
                return Ok(());
            }
            let Some(parent) = repository.super_module().map(|s| s.repo.clone()) else {
                return Ok(());
            };
            self.repo_mut(&parent)?.add_pending_submodule_ref();
            current = parent;
        }
    }

    /// Common prologue of every change: the revision, bounds check,
    /// modification mark and a running importer.
    fn prepare(&mut self, repo: &str, ref_name: &str) -> Result<Revnum> {
        let revision = self.current()?.revision;
        self.repo_mut(repo)?.check_bounds(ref_name, revision);
        self.mark_modified(repo, ref_name)?;
        self.touch(repo)?;
        Ok(revision)
    }

    pub fn add_file(
        &mut self,
        repo: &str,
        branch: &str,
        svn_prefix: &str,
        path: &str,
        mode: u32,
        data: &[u8],
    ) -> Result<()> {
        let revision = self.prepare(repo, branch)?;
        self.repo_mut(repo)?
            .add_file(branch, svn_prefix, revision, path, mode, data)
    }

    pub fn delete_path(
        &mut self,
        repo: &str,
        branch: &str,
        svn_prefix: &str,
        path: &str,
    ) -> Result<()> {
        let revision = self.prepare(repo, branch)?;
        self.repo_mut(repo)?
            .delete_path(branch, svn_prefix, revision, path)
    }

    pub fn create_branch(
        &mut self,
        repo: &str,
        branch: &str,
        from_branch: &str,
        from_revision: Revnum,
    ) -> Result<()> {
        let revision = self.prepare(repo, branch)?;
        self.repo_mut(repo)?
            .create_branch(branch, revision, from_branch, from_revision)
    }

    pub fn delete_branch(&mut self, repo: &str, branch: &str) -> Result<()> {
        let revision = self.prepare(repo, branch)?;
        self.repo_mut(repo)?.delete_branch(branch, revision)
    }

    pub fn merge_from(
        &mut self,
        repo: &str,
        branch: &str,
        svn_prefix: &str,
        from_branch: &str,
        from_revision: Revnum,
    ) -> Result<()> {
        let revision = self.prepare(repo, branch)?;
        self.repo_mut(repo)?
            .note_copy_from_branch(branch, svn_prefix, revision, from_branch, from_revision)
    }

    /// Queue an annotated tag on `tag_ref`, written once the revision's
    /// commits are.
    pub fn annotated_tag(&mut self, repo: &str, tag_ref: &str, svn_prefix: &str) -> Result<()> {
        let info = self.current()?.clone();
        self.repo_mut(repo)?.create_annotated_tag(
            tag_ref,
            svn_prefix,
            info.revision,
            &info.author,
            info.epoch,
            &info.message,
        );
        Ok(())
    }

    /// Write everything staged for the open revision.
    ///
    /// Repositories close in passes. A parent waits while any child still
    /// owes it a report; each child close reports the new tips and stages the
    /// matching gitlink updates in the parent. A pass that closes nothing
    /// while work remains is an error.
    pub fn end_revision(&mut self) -> Result<()> {
        let info = self
            .revision
            .take()
            .ok_or_else(|| Error::Input("no revision to end".to_string()))?;
        self.discovering = false;

        loop {
            let pending: Vec<String> = self
                .repositories
                .values()
                .filter(|r| r.has_pending_work())
                .map(|r| r.name().to_string())
                .collect();
            if pending.is_empty() {
                break;
            }

            let mut closed_any = false;
            let discovering = self.discovering;
            for name in &pending {
                if self.repo_mut(name)?.defer_close(discovering) {
                    tracing::trace!(repo = %name, "deferring close until submodules report");
                    continue;
                }
                self.touch(name)?;
                let reports = self.repo_mut(name)?.close_revision(&info)?;
                closed_any = true;
                self.report_to_parent(name, reports, info.revision)?;
            }

            if !closed_any {
                return Err(Error::UnresolvedClose {
                    revision: info.revision,
                    repos: pending,
                });
            }
        }

        let tagged: Vec<String> = self
            .repositories
            .values()
            .filter(|r| r.has_pending_tags())
            .map(|r| r.name().to_string())
            .collect();
        for name in tagged {
            self.touch(&name)?;
            self.repo_mut(&name)?.finalize_tags()?;
        }
        Ok(())
    }

    fn report_to_parent(
        &mut self,
        child: &str,
        reports: Vec<(String, Mark)>,
        revision: Revnum,
    ) -> Result<()> {
        if reports.is_empty() {
            return Ok(());
        }
        let Some(super_module) = self.repo_mut(child)?.super_module().cloned() else {
            return Ok(());
        };
        self.touch(&super_module.repo)?;
        let parent = self.repo_mut(&super_module.repo)?;
        for (ref_name, mark) in reports {
            parent.submodule_changed(child, &super_module.path, &ref_name, mark, revision)?;
        }
        Ok(())
    }

    /// Close every importer. Marks files are complete afterwards.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(open) = &self.revision {
            tracing::warn!("r{} was never ended; its changes are dropped", open.revision);
        }
        for repo in self.repositories.values_mut() {
            repo.close_process()?;
            self.pool.remove(repo.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::config::{RefRule, RepositoryRule};
    use crate::git::{Backend, DryRunSink};

    fn rule(name: &str, parent: Option<(&str, &str)>) -> RepositoryRule {
        RepositoryRule {
            name: name.to_string(),
            branches: vec![RefRule {
                name: "refs/heads/master".to_string(),
                min: 1,
                max: None,
            }],
            tags: Vec::new(),
            submodule_of: parent.map(|(p, _)| p.to_string()),
            submodule_path: parent.map(|(_, path)| path.to_string()),
        }
    }

    fn registry(dir: &Path, rules: Vec<RepositoryRule>) -> Registry {
        let options = ImportOptions {
            output_dir: dir.to_path_buf(),
            dry_run: true,
            submodule_url_base: "https://example.org/".to_string(),
            ..ImportOptions::default()
        };
        let rules = RulesConfig {
            repositories: rules,
            ..RulesConfig::default()
        };
        Registry::from_config(&rules, options).unwrap()
    }

    fn info(revision: Revnum) -> RevisionInfo {
        RevisionInfo {
            revision,
            author: "Jane <jane@example.org>".to_string(),
            epoch: 1000 + revision as i64,
            message: format!("r{revision}"),
        }
    }

    fn log(registry: &Registry, name: &str) -> String {
        fs::read_to_string(registry.repository(name).unwrap().log_path()).unwrap_or_default()
    }

    #[test]
    fn test_conflicting_declarations() {
        let dir = tempfile::tempdir().unwrap();
        let rules = RulesConfig {
            repositories: vec![
                rule("boost", None),
                rule("other", None),
                rule("any", Some(("boost", "libs/any"))),
                rule("any", Some(("other", "libs/any"))),
            ],
            ..RulesConfig::default()
        };
        let err = Registry::from_config(&rules, ImportOptions {
            output_dir: dir.path().to_path_buf(),
            dry_run: true,
            ..ImportOptions::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::ConflictingSuperModule { .. }));

        let rules = RulesConfig {
            repositories: vec![
                rule("boost", None),
                rule("any", Some(("boost", "libs/any"))),
                rule("any", Some(("boost", "libs/other"))),
            ],
            ..RulesConfig::default()
        };
        let err = Registry::from_config(&rules, ImportOptions {
            output_dir: dir.path().to_path_buf(),
            dry_run: true,
            ..ImportOptions::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::ConflictingSubmodulePath { .. }));
    }

    #[test]
    fn test_unknown_parent_and_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let options = ImportOptions {
            output_dir: dir.path().to_path_buf(),
            dry_run: true,
            ..ImportOptions::default()
        };

        let rules = RulesConfig {
            repositories: vec![rule("any", Some(("boost", "libs/any")))],
            ..RulesConfig::default()
        };
        let err = Registry::from_config(&rules, options.clone()).err().unwrap();
        assert!(matches!(err, Error::UnknownRepository { .. }));

        let rules = RulesConfig {
            repositories: vec![rule("a", Some(("b", "b"))), rule("b", Some(("a", "a")))],
            ..RulesConfig::default()
        };
        let err = Registry::from_config(&rules, options).err().unwrap();
        assert!(matches!(err, Error::SubmoduleCycle { .. }));
    }

    #[test]
    fn test_revisions_must_ascend() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path(), vec![rule("A", None)]);
        registry.begin_revision(info(2)).unwrap();
        registry.end_revision().unwrap();
        let err = registry.begin_revision(info(2)).unwrap_err();
        assert!(matches!(err, Error::OutOfOrderRevision { previous: 2, revision: 2 }));
        assert!(registry.add_file("A", "refs/heads/master", "/trunk", "x", 0o100644, b"x").is_err());
    }

    #[test]
    fn test_delete_then_create_keeps_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path(), vec![rule("A", None)]);

        registry.begin_revision(info(1)).unwrap();
        registry.add_file("A", "refs/heads/master", "/trunk", "x", 0o100644, b"hi").unwrap();
        registry.end_revision().unwrap();

        registry.begin_revision(info(2)).unwrap();
        registry.create_branch("A", "refs/heads/b", "refs/heads/master", 1).unwrap();
        registry.end_revision().unwrap();

        registry.begin_revision(info(3)).unwrap();
        registry.delete_branch("A", "refs/heads/b").unwrap();
        registry.create_branch("A", "refs/heads/b", "refs/heads/master", 1).unwrap();
        registry.end_revision().unwrap();
        registry.finish().unwrap();

        let text = log(&registry, "A");
        assert_eq!(text.matches("reset refs/tags/backups/b@3\n").count(), 1);
        assert!(!text.contains("SVN r3 branch refs/heads/b = :0"));
        assert!(text.contains("progress SVN r3 branch refs/heads/b = :1 # from branch refs/heads/master at r1"));
    }

    #[test]
    fn test_create_then_delete_drops_both() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path(), vec![rule("A", None)]);

        registry.begin_revision(info(1)).unwrap();
        registry.add_file("A", "refs/heads/master", "/trunk", "x", 0o100644, b"hi").unwrap();
        registry.end_revision().unwrap();

        registry.begin_revision(info(2)).unwrap();
        registry.create_branch("A", "refs/heads/b", "refs/heads/master", 1).unwrap();
        registry.delete_branch("A", "refs/heads/b").unwrap();
        registry.end_revision().unwrap();
        registry.finish().unwrap();

        let text = log(&registry, "A");
        assert!(!text.contains("refs/heads/b"));
        assert!(!registry.repository("A").unwrap().branch("refs/heads/b").unwrap().exists());
    }

    #[test]
    fn test_branch_from_missing_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path(), vec![rule("A", None)]);
        registry.begin_revision(info(1)).unwrap();
        let err = registry
            .create_branch("A", "refs/heads/b", "refs/heads/nowhere", 1)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::BranchSourceMissing { .. }));
    }

    #[test]
    fn test_default_branch_is_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path(), vec![rule("A", None)]);
        registry.begin_revision(info(1)).unwrap();
        registry.add_file("A", "refs/heads/master", "/trunk", "x", 0o100644, b"hi").unwrap();
        registry.end_revision().unwrap();
        registry.begin_revision(info(2)).unwrap();
        registry.delete_branch("A", "refs/heads/master").unwrap();
        registry.end_revision().unwrap();
        assert!(registry.repository("A").unwrap().branch("refs/heads/master").unwrap().exists());
    }

    #[test]
    fn test_submodule_change_reaches_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(
            dir.path(),
            vec![rule("boost", None), rule("any", Some(("boost", "libs/any")))],
        );

        registry.begin_revision(info(1)).unwrap();
        registry.add_file("any", "refs/heads/master", "/trunk/libs/any", "any.hpp", 0o100644, b"x").unwrap();
        assert_eq!(registry.repository("boost").unwrap().pending_submodule_refs(), 1);
        registry.end_revision().unwrap();

        let boost = registry.repository("boost").unwrap();
        assert_eq!(boost.pending_submodule_refs(), 0);
        let master = boost.branch("refs/heads/master").unwrap();
        assert_eq!(master.submodules.get("libs/any").map(String::as_str), Some("any"));
        assert_eq!(master.last_submodule_list_change_rev, Some(1));
        registry.finish().unwrap();

        let text = log(&registry, "boost");
        let gitlink = format!("M 160000 {:040} libs/any\n", 1);
        assert!(text.contains(&gitlink));
        assert!(text.contains("M 100644 :1048574 .gitmodules\n"));
        assert!(text.contains("progress SVN r1 branch refs/heads/master = :1"));

        // the child is written before the parent is
        let any = log(&registry, "any");
        assert!(any.contains("progress SVN r1 branch refs/heads/master = :1"));
    }

    #[test]
    fn test_submodule_branch_deletion_removes_gitlink() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(
            dir.path(),
            vec![rule("boost", None), rule("any", Some(("boost", "libs/any")))],
        );

        registry.begin_revision(info(1)).unwrap();
        registry.add_file("any", "refs/heads/b", "/branches/b/libs/any", "a", 0o100644, b"x").unwrap();
        registry.end_revision().unwrap();

        registry.begin_revision(info(2)).unwrap();
        registry.delete_branch("any", "refs/heads/b").unwrap();
        registry.end_revision().unwrap();
        registry.finish().unwrap();

        let boost = registry.repository("boost").unwrap();
        assert!(boost.branch("refs/heads/b").unwrap().submodules.is_empty());
        let text = log(&registry, "boost");
        assert!(text.contains("D libs/any\n"));
        assert!(text.contains("D .gitmodules\n"));
    }

    #[test]
    fn test_unchanged_tree_rewinds_ref() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path(), vec![rule("A", None)]);
        let sha = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
        let other = "aa825dc642cb6eb9a060e54bf8d69288fbee4904";
        let log_path = registry.repository("A").unwrap().log_path();
        let sink = DryRunSink::to_file(&log_path).unwrap().with_trees([other, sha, sha]);
        registry.repository_mut("A").unwrap().set_backend(Backend::DryRun(sink));

        for revision in 1..=3 {
            registry.begin_revision(info(revision)).unwrap();
            registry
                .add_file("A", "refs/heads/master", "/trunk", "x", 0o100644, format!("{revision}").as_bytes())
                .unwrap();
            registry.end_revision().unwrap();
        }
        registry.finish().unwrap();

        let master = registry.repository("A").unwrap().branch("refs/heads/master").unwrap();
        assert_eq!(master.history(), &[(1, 1), (2, 2)]);
        assert_eq!(master.head_tree.as_deref(), Some(sha));

        let text = log(&registry, "A");
        assert_eq!(text.matches("ls \"\"\n").count(), 3);
        assert!(text.contains("reset refs/heads/master\nfrom :2\n"));
        assert!(text.contains("progress SVN r3 branch refs/heads/master = :2 # unchanged tree"));
    }

    #[test]
    fn test_merge_without_tree_change_rewinds_ref() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path(), vec![rule("A", None)]);
        let branch_tree = "aa825dc642cb6eb9a060e54bf8d69288fbee4904";
        let master_tree = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
        let log_path = registry.repository("A").unwrap().log_path();
        let sink = DryRunSink::to_file(&log_path)
            .unwrap()
            .with_trees([branch_tree, master_tree, master_tree]);
        registry.repository_mut("A").unwrap().set_backend(Backend::DryRun(sink));

        registry.begin_revision(info(1)).unwrap();
        registry.add_file("A", "refs/heads/master", "/trunk", "x", 0o100644, b"x").unwrap();
        registry.add_file("A", "refs/heads/b", "/branches/b", "y", 0o100644, b"y").unwrap();
        registry.end_revision().unwrap();

        registry.begin_revision(info(2)).unwrap();
        registry.merge_from("A", "refs/heads/master", "/trunk", "refs/heads/b", 1).unwrap();
        registry.end_revision().unwrap();
        registry.finish().unwrap();

        let master = registry.repository("A").unwrap().branch("refs/heads/master").unwrap();
        assert_eq!(master.history(), &[(1, 2)]);

        let text = log(&registry, "A");
        assert!(text.contains("from :2\nmerge :1\n"));
        assert!(text.contains("reset refs/heads/master\nfrom :2\n"));
        assert!(text.contains("progress SVN r2 branch refs/heads/master = :2 # unchanged tree"));
    }
}
