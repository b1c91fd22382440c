//! The change stream: one JSON object per line describing a revision and the
//! already-routed changes it makes to destination repositories.

use std::io::BufRead;

use base64::Engine;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::registry::Registry;
use crate::repository::{RevisionInfo, Revnum};
use crate::{Error, Result};

const DEFAULT_MODE: u32 = 0o100644;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RevisionRecord {
    pub revision: Revnum,
    pub author: String,
    /// Seconds since the epoch; `date` is used when absent.
    #[serde(default)]
    pub epoch: Option<i64>,
    #[serde(default)]
    pub date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl RevisionRecord {
    pub fn info(&self) -> Result<RevisionInfo> {
        let epoch = match (self.epoch, self.date) {
            (Some(epoch), _) => epoch,
            (None, Some(date)) => date.timestamp(),
            (None, None) => {
                return Err(Error::Input(format!(
                    "r{} has neither epoch nor date",
                    self.revision
                )))
            }
        };
        Ok(RevisionInfo {
            revision: self.revision,
            author: self.author.clone(),
            epoch,
            message: self.message.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Change {
    AddFile {
        repo: String,
        branch: String,
        #[serde(default)]
        svn_path: String,
        path: String,
        /// Octal, e.g. `100755`
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        data_base64: Option<String>,
    },
    DeletePath {
        repo: String,
        branch: String,
        #[serde(default)]
        svn_path: String,
        path: String,
    },
    CreateBranch {
        repo: String,
        branch: String,
        from_branch: String,
        from_revision: Revnum,
    },
    DeleteBranch {
        repo: String,
        branch: String,
    },
    MergeFrom {
        repo: String,
        branch: String,
        #[serde(default)]
        svn_path: String,
        from_branch: String,
        from_revision: Revnum,
    },
    AnnotatedTag {
        repo: String,
        tag: String,
        #[serde(default)]
        svn_path: String,
    },
}

fn parse_mode(mode: Option<&str>) -> Result<u32> {
    match mode {
        None => Ok(DEFAULT_MODE),
        Some(text) => u32::from_str_radix(text, 8)
            .map_err(|e| Error::Input(format!("invalid file mode {text:?}: {e}"))),
    }
}

fn file_content(path: &str, data: Option<&str>, data_base64: Option<&str>) -> Result<Vec<u8>> {
    match (data, data_base64) {
        (Some(_), Some(_)) => Err(Error::Input(format!(
            "{path}: both data and data_base64 given"
        ))),
        (Some(text), None) => Ok(text.as_bytes().to_vec()),
        (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Input(format!("{path}: invalid base64 content: {e}"))),
        (None, None) => Ok(Vec::new()),
    }
}

impl Change {
    pub fn apply(&self, registry: &mut Registry) -> Result<()> {
        match self {
            Change::AddFile {
                repo,
                branch,
                svn_path,
                path,
                mode,
                data,
                data_base64,
            } => {
                let mode = parse_mode(mode.as_deref())?;
                let content = file_content(path, data.as_deref(), data_base64.as_deref())?;
                registry.add_file(repo, branch, svn_path, path, mode, &content)
            }
            Change::DeletePath {
                repo,
                branch,
                svn_path,
                path,
            } => registry.delete_path(repo, branch, svn_path, path),
            Change::CreateBranch {
                repo,
                branch,
                from_branch,
                from_revision,
            } => registry.create_branch(repo, branch, from_branch, *from_revision),
            Change::DeleteBranch { repo, branch } => registry.delete_branch(repo, branch),
            Change::MergeFrom {
                repo,
                branch,
                svn_path,
                from_branch,
                from_revision,
            } => registry.merge_from(repo, branch, svn_path, from_branch, *from_revision),
            Change::AnnotatedTag { repo, tag, svn_path } => {
                registry.annotated_tag(repo, tag, svn_path)
            }
        }
    }
}

/// Iterator over the records of a change stream. Blank lines are skipped.
pub struct ChangeReader<R> {
    reader: R,
    line: usize,
}

impl<R: BufRead> ChangeReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: 0 }
    }
}

impl<R: BufRead> Iterator for ChangeReader<R> {
    type Item = Result<RevisionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = String::new();
        loop {
            buf.clear();
            self.line += 1;
            match self.reader.read_line(&mut buf) {
                Ok(0) => return None,
                Ok(_) if buf.trim().is_empty() => continue,
                Ok(_) => {
                    return Some(
                        serde_json::from_str(&buf)
                            .map_err(|e| Error::Input(format!("line {}: {e}", self.line))),
                    )
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Which revisions of the stream to import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevisionRange {
    /// First revision to apply; earlier ones were imported by a previous run
    pub start: Revnum,
    pub max: Option<Revnum>,
}

/// Feed every record in `range` to the registry. `on_revision` is called
/// before each applied revision. Returns the number of revisions applied.
pub fn import<R, F>(
    registry: &mut Registry,
    records: ChangeReader<R>,
    range: RevisionRange,
    mut on_revision: F,
) -> Result<u64>
where
    R: BufRead,
    F: FnMut(Revnum),
{
    let mut applied = 0;
    let mut previous: Option<Revnum> = None;

    for record in records {
        let record = record?;
        if let Some(previous) = previous {
            if record.revision <= previous {
                return Err(Error::OutOfOrderRevision {
                    previous,
                    revision: record.revision,
                });
            }
        }
        previous = Some(record.revision);

        if record.revision < range.start {
            tracing::trace!("skipping r{}, imported already", record.revision);
            continue;
        }
        if range.max.is_some_and(|max| record.revision > max) {
            tracing::debug!("stopping before r{}", record.revision);
            break;
        }

        on_revision(record.revision);
        registry.begin_revision(record.info()?)?;
        for change in &record.changes {
            change.apply(registry)?;
        }
        registry.end_revision()?;
        applied += 1;
    }
    Ok(applied)
}
