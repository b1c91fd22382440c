use std::io;

use thiserror::Error;

use crate::repository::{Mark, Revnum};

/// How a failure should be treated by the top-level handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Aborts the run immediately.
    Fatal,
    /// The rule set or the change stream is inconsistent; nothing was imported
    /// for the offending input.
    Config,
    /// Recoverable; callers usually log it and continue.
    Warning,
}

/// Why a branch source could not be resolved to a commit mark.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MarkLookupError {
    #[error("branch {branch} has never existed")]
    NeverExisted { branch: String },
    #[error("no commit found at or before r{revision} of branch {branch}")]
    TooEarly { branch: String, revision: Revnum },
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("git-fast-import for repository {repo} has been started once and exited")]
    ProcessExited { repo: String },

    #[error("failed to start git-fast-import for repository {repo}: {source}")]
    ProcessStart {
        repo: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to git-fast-import for repository {repo}: {source}")]
    Write {
        repo: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read from git-fast-import for repository {repo}: {reason}")]
    Read { repo: String, reason: String },

    #[error("commit mark :{commit_mark} collides with file mark :{file_mark} in repository {repo}")]
    MarkCollision {
        repo: String,
        commit_mark: Mark,
        file_mark: Mark,
    },

    #[error("{branch} in repository {repo} is branching from branch {source_branch} but the latter doesn't exist")]
    BranchSourceMissing {
        repo: String,
        branch: String,
        source_branch: String,
    },

    #[error("repositories {repos:?} still have deferred commits at the end of r{revision}")]
    UnresolvedClose { revision: Revnum, repos: Vec<String> },

    #[error("cannot resume from r{resume_from}: the previous run is only complete up to r{revision}")]
    CannotResume { resume_from: Revnum, revision: Revnum },

    #[error("conflicting super-module specifications for repository {repo}: {first} and {second}")]
    ConflictingSuperModule {
        repo: String,
        first: String,
        second: String,
    },

    #[error("conflicting submodule path declarations for repository {repo}: {first} and {second}")]
    ConflictingSubmodulePath {
        repo: String,
        first: String,
        second: String,
    },

    #[error("unknown repository {name}")]
    UnknownRepository { name: String },

    #[error("repository {repo} is its own super-module through {chain:?}")]
    SubmoduleCycle { repo: String, chain: Vec<String> },

    #[error("revision r{revision} follows r{previous}; revisions must be strictly ascending")]
    OutOfOrderRevision { previous: Revnum, revision: Revnum },

    #[error("invalid change stream: {0}")]
    Input(String),

    #[error(transparent)]
    MarkLookup(#[from] MarkLookupError),

    #[error("YAML error: {0}")]
    Rules(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProcessExited { .. }
            | Error::ProcessStart { .. }
            | Error::Write { .. }
            | Error::Read { .. }
            | Error::MarkCollision { .. }
            | Error::BranchSourceMissing { .. }
            | Error::UnresolvedClose { .. }
            | Error::CannotResume { .. }
            | Error::Io(_) => ErrorKind::Fatal,
            Error::ConflictingSuperModule { .. }
            | Error::ConflictingSubmodulePath { .. }
            | Error::UnknownRepository { .. }
            | Error::SubmoduleCycle { .. }
            | Error::OutOfOrderRevision { .. }
            | Error::Input(_)
            | Error::Rules(_) => ErrorKind::Config,
            Error::MarkLookup(_) => ErrorKind::Warning,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = Error::ProcessExited {
            repo: "boost".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("boost"));

        let err = Error::ConflictingSubmodulePath {
            repo: "any".to_string(),
            first: "libs/any".to_string(),
            second: "libs/other".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Config);

        let err: Error = MarkLookupError::TooEarly {
            branch: "refs/heads/master".to_string(),
            revision: 3,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Warning);
    }
}
