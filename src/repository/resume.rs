//! Rebuilding branch state from the log of a previous run.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::{MarkAllocator, Repository, Revnum};
use crate::git::fast_import::parse_progress_record;
use crate::git::marks::scan_file;
use crate::Result;

fn backup_path(log: &Path) -> PathBuf {
    let mut name = log.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// Length of the payload announced by a `data <count>` line.
fn data_length(line: &[u8]) -> Option<usize> {
    let count = line.strip_prefix(b"data ")?;
    let count = count.strip_suffix(b"\n").unwrap_or(count);
    std::str::from_utf8(count).ok()?.parse().ok()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Repository {
    /// Replay the progress records of the log, stopping before `cutoff`.
    ///
    /// A record whose mark the mark index does not confirm means the last
    /// run died mid-write: `cutoff` is lowered to that record's revision.
    /// Whenever records are dropped, the log is saved as `.old` and
    /// truncated in front of the first dropped one. Returns the revision to
    /// continue with.
    pub fn setup_incremental(&mut self, cutoff: &mut Revnum) -> Result<Revnum> {
        let log_path = self.log_path();
        let content = match fs::read(&log_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(e.into()),
        };
        let last_valid_mark = scan_file(&self.marks_path())?.last_valid_mark();
        let backup = backup_path(&log_path);

        let mut last_revnum: Revnum = 0;
        let mut pos = 0;
        while pos < content.len() {
            let start = pos;
            let end = content[start..]
                .iter()
                .position(|b| *b == b'\n')
                .map_or(content.len(), |i| start + i + 1);
            let line = &content[start..end];
            pos = end;
            // commit messages and blobs are never records
            if let Some(len) = data_length(line) {
                pos = pos.saturating_add(len).min(content.len());
                continue;
            }
            let Some((revision, ref_name, mark)) =
                parse_progress_record(&String::from_utf8_lossy(line))
            else {
                continue;
            };

            if revision >= *cutoff {
                return self.truncate_log(&log_path, &backup, start, *cutoff);
            }
            if revision < last_revnum {
                tracing::warn!(
                    repo = %self.name,
                    "revision numbers are not monotonic: got {last_revnum} and then {revision}"
                );
            }
            if mark > last_valid_mark {
                tracing::warn!(
                    repo = %self.name,
                    "unknown commit mark :{mark} found in r{revision}: rewinding -- did you hit Ctrl-C?"
                );
                *cutoff = revision;
                return self.truncate_log(&log_path, &backup, start, revision);
            }

            last_revnum = revision;
            self.marks.observe_commit_mark(mark);
            self.branches.entry(ref_name).or_default().replay(revision, mark);
        }

        let next = last_revnum + 1;
        if next == *cutoff {
            // a stale backup would be restored by mistake on retry
            remove_if_exists(&backup)?;
        }
        Ok(next)
    }

    fn truncate_log(
        &self,
        log: &Path,
        backup: &Path,
        len: usize,
        cutoff: Revnum,
    ) -> Result<Revnum> {
        remove_if_exists(backup)?;
        fs::copy(log, backup)?;
        OpenOptions::new().write(true).open(log)?.set_len(len as u64)?;
        tracing::debug!(repo = %self.name, "truncating history to revision {cutoff}");
        Ok(cutoff)
    }

    /// Put back the log saved by the last truncation, if any.
    pub fn restore_log(&self) -> Result<()> {
        let log = self.log_path();
        let backup = backup_path(&log);
        if !backup.exists() {
            return Ok(());
        }
        remove_if_exists(&log)?;
        fs::rename(&backup, &log)?;
        Ok(())
    }

    /// Drop everything learned from replaying, keeping declared refs.
    pub fn forget_history(&mut self) {
        self.branches.retain(|name, _| self.declared.contains_key(name));
        for branch in self.branches.values_mut() {
            branch.clear_history();
        }
        self.branches
            .entry(self.options.default_branch.clone())
            .or_default();
        self.marks = MarkAllocator::default();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::config::ImportOptions;

    fn repo(dir: &Path) -> Repository {
        let options = ImportOptions {
            output_dir: dir.to_path_buf(),
            dry_run: true,
            incremental: true,
            ..ImportOptions::default()
        };
        Repository::new("A", Arc::new(options), BTreeMap::new()).unwrap()
    }

    fn write_marks(repo: &Repository, count: u64) {
        fs::create_dir_all(repo.git_dir()).unwrap();
        let lines: String = (1..=count).map(|m| format!(":{m} {m:040x}\n")).collect();
        fs::write(repo.marks_path(), lines).unwrap();
    }

    const LOG: &str = "\
progress SVN r1 branch refs/heads/master = :1

progress Branch refs/heads/master reloaded
progress SVN r3 branch refs/heads/master = :2 # merge from :1
progress SVN r3 branch refs/heads/b = :3
progress SVN r5 branch refs/heads/b = :0 # delete
";

    #[test]
    fn test_replay_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repo = repo(dir.path());
        write_marks(&repo, 3);
        fs::write(repo.log_path(), LOG)?;

        let mut cutoff = Revnum::MAX;
        assert_eq!(repo.setup_incremental(&mut cutoff)?, 6);
        assert_eq!(cutoff, Revnum::MAX);
        assert_eq!(repo.last_commit_mark(), 3);

        let master = repo.branch("refs/heads/master").unwrap();
        assert_eq!(master.history(), &[(1, 1), (3, 2)]);
        let b = repo.branch("refs/heads/b").unwrap();
        assert!(!b.exists());
        assert_eq!(b.last_change_rev(), Some(5));
        assert_eq!(fs::read_to_string(repo.log_path())?, LOG);
        Ok(())
    }

    #[test]
    fn test_unconfirmed_mark_rewinds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repo = repo(dir.path());
        write_marks(&repo, 2);
        fs::write(repo.log_path(), LOG)?;

        let mut cutoff = Revnum::MAX;
        assert_eq!(repo.setup_incremental(&mut cutoff)?, 3);
        assert_eq!(cutoff, 3);

        let truncated = fs::read_to_string(repo.log_path())?;
        assert!(truncated.ends_with("progress SVN r3 branch refs/heads/master = :2 # merge from :1\n"));
        assert_eq!(fs::read_to_string(backup_path(&repo.log_path()))?, LOG);

        repo.restore_log()?;
        assert_eq!(fs::read_to_string(repo.log_path())?, LOG);
        assert!(!backup_path(&repo.log_path()).exists());
        Ok(())
    }

    #[test]
    fn test_cutoff_truncates_at_first_later_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repo = repo(dir.path());
        write_marks(&repo, 3);
        fs::write(repo.log_path(), LOG)?;

        let mut cutoff = 3;
        assert_eq!(repo.setup_incremental(&mut cutoff)?, 3);
        assert_eq!(
            fs::read_to_string(repo.log_path())?,
            "progress SVN r1 branch refs/heads/master = :1\n\nprogress Branch refs/heads/master reloaded\n"
        );
        assert_eq!(repo.branch("refs/heads/master").unwrap().history(), &[(1, 1)]);
        Ok(())
    }

    #[test]
    fn test_corrupt_marks_trust_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repo = repo(dir.path());
        fs::create_dir_all(repo.git_dir())?;
        fs::write(repo.marks_path(), ":1 aa\n:1 aa\n:2 bb\n")?;
        fs::write(repo.log_path(), LOG)?;

        let mut cutoff = Revnum::MAX;
        assert_eq!(repo.setup_incremental(&mut cutoff)?, 1);
        assert_eq!(cutoff, 1);
        assert_eq!(fs::read_to_string(repo.log_path())?, "");
        Ok(())
    }

    #[test]
    fn test_record_inside_payload_is_ignored() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repo = repo(dir.path());
        write_marks(&repo, 1);
        let message = "progress SVN r9 branch refs/heads/x = :7\n";
        let log = format!(
            "commit refs/heads/master\nmark :1\ncommitter a <a> 1 +0000\ndata {}\n{message}\n\
             progress SVN r1 branch refs/heads/master = :1\n\n",
            message.len()
        );
        fs::write(repo.log_path(), &log)?;

        let mut cutoff = Revnum::MAX;
        assert_eq!(repo.setup_incremental(&mut cutoff)?, 2);
        assert!(repo.branch("refs/heads/x").is_none());
        assert_eq!(repo.last_commit_mark(), 1);
        assert_eq!(repo.branch("refs/heads/master").unwrap().history(), &[(1, 1)]);
        assert_eq!(fs::read_to_string(repo.log_path())?, log);
        Ok(())
    }

    #[test]
    fn test_data_length() {
        assert_eq!(data_length(b"data 12\n"), Some(12));
        assert_eq!(data_length(b"data 0\n"), Some(0));
        assert_eq!(data_length(b"data <<EOF\n"), None);
        assert_eq!(data_length(b"progress data 3\n"), None);
    }

    #[test]
    fn test_missing_log_starts_at_one() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repo = repo(dir.path());
        let mut cutoff = Revnum::MAX;
        assert_eq!(repo.setup_incremental(&mut cutoff)?, 1);
        Ok(())
    }

    #[test]
    fn test_forget_history() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut repo = repo(dir.path());
        write_marks(&repo, 3);
        fs::write(repo.log_path(), LOG)?;
        let mut cutoff = Revnum::MAX;
        repo.setup_incremental(&mut cutoff)?;

        repo.forget_history();
        assert!(repo.branch("refs/heads/b").is_none());
        assert!(repo.branch("refs/heads/master").unwrap().history().is_empty());
        assert_eq!(repo.last_commit_mark(), 0);
        Ok(())
    }
}
