use std::io;

use super::process::FastImportProcess;
use super::sink::DryRunSink;
use crate::{Error, Result};

/// What the repository state machine needs from an importer.
pub trait FastImportBackend {
    /// Queue bytes for the importer. May block on backpressure.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Block until every queued byte has been handed to the importer.
    fn flush(&mut self) -> io::Result<()>;

    /// Whether `ls` queries get answered.
    fn answers_queries(&self) -> bool;

    /// Next answer to an `ls` query, or `None` once no answer can come.
    fn read_response(&mut self) -> io::Result<Option<String>>;

    fn is_running(&mut self) -> bool;

    /// Checkpoint and shut down.
    fn close(&mut self) -> io::Result<()>;
}

/// The importer variants a repository can be constructed with.
pub enum Backend {
    Process(FastImportProcess),
    DryRun(DryRunSink),
}

impl FastImportBackend for Backend {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Backend::Process(p) => p.write_all(bytes),
            Backend::DryRun(s) => s.write_all(bytes),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Backend::Process(p) => p.flush(),
            Backend::DryRun(s) => s.flush(),
        }
    }

    fn answers_queries(&self) -> bool {
        match self {
            Backend::Process(p) => p.answers_queries(),
            Backend::DryRun(s) => s.answers_queries(),
        }
    }

    fn read_response(&mut self) -> io::Result<Option<String>> {
        match self {
            Backend::Process(p) => p.read_response(),
            Backend::DryRun(s) => s.read_response(),
        }
    }

    fn is_running(&mut self) -> bool {
        match self {
            Backend::Process(p) => p.is_running(),
            Backend::DryRun(s) => s.is_running(),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            Backend::Process(p) => p.close(),
            Backend::DryRun(s) => s.close(),
        }
    }
}

/// Lifecycle of one repository's importer.
///
/// An importer closed on purpose (pool eviction) may be started again. One
/// that exited on its own may not: touching it again is fatal.
pub struct ProcessHandle {
    repo: String,
    backend: Option<Backend>,
    has_started: bool,
}

impl ProcessHandle {
    pub fn new(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            backend: None,
            has_started: false,
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.backend.as_mut().is_some_and(Backend::is_running)
    }

    /// Whether the caller must start a new importer. Fails if the previous
    /// one died on its own.
    pub fn needs_start(&mut self) -> Result<bool> {
        if self.is_running() {
            return Ok(false);
        }
        if self.has_started {
            return Err(Error::ProcessExited {
                repo: self.repo.clone(),
            });
        }
        Ok(true)
    }

    pub fn attach(&mut self, backend: Backend) {
        self.backend = Some(backend);
        self.has_started = true;
    }

    fn live(&mut self) -> Result<&mut Backend> {
        if let Some(backend) = self.backend.as_mut() {
            if backend.is_running() {
                return Ok(backend);
            }
        }
        Err(Error::ProcessExited {
            repo: self.repo.clone(),
        })
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let repo = self.repo.clone();
        self.live()?
            .write_all(bytes)
            .map_err(|source| Error::Write { repo, source })
    }

    /// Block until the importer has every byte written so far.
    pub fn flush(&mut self) -> Result<()> {
        let repo = self.repo.clone();
        self.live()?
            .flush()
            .map_err(|source| Error::Write { repo, source })
    }

    pub fn answers_queries(&self) -> bool {
        self.backend.as_ref().is_some_and(Backend::answers_queries)
    }

    pub fn read_response(&mut self) -> Result<Option<String>> {
        let repo = self.repo.clone();
        self.live()?.read_response().map_err(|e| Error::Read {
            repo,
            reason: e.to_string(),
        })
    }

    /// Checkpoint and stop the importer, leaving the handle restartable.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut backend) = self.backend.take() {
            if backend.is_running() {
                backend.close().map_err(|source| Error::Write {
                    repo: self.repo.clone(),
                    source,
                })?;
            }
        }
        self.has_started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() -> Result<()> {
        let mut handle = ProcessHandle::new("a");
        assert!(handle.needs_start()?);
        assert!(handle.write(b"x").is_err());

        handle.attach(Backend::DryRun(DryRunSink::new(Box::new(io::sink()))));
        assert!(!handle.needs_start()?);
        handle.write(b"progress x\n")?;
        handle.flush()?;

        handle.close()?;
        assert!(!handle.is_running());
        assert!(handle.needs_start()?);
        Ok(())
    }

    #[test]
    fn test_exited_importer_is_fatal() {
        let mut handle = ProcessHandle::new("a");
        let mut sink = DryRunSink::new(Box::new(io::sink()));
        sink.close().unwrap();
        handle.attach(Backend::DryRun(sink));
        let err = handle.needs_start().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::ProcessExited { .. }));
    }

    #[test]
    fn test_write_after_importer_exit_fails() {
        let mut handle = ProcessHandle::new("a");
        let mut sink = DryRunSink::new(Box::new(io::sink()));
        sink.close().unwrap();
        handle.attach(Backend::DryRun(sink));

        let err = handle.write(b"progress x\n").unwrap_err();
        assert!(matches!(err, Error::ProcessExited { ref repo } if repo == "a"));
        assert!(matches!(handle.flush(), Err(Error::ProcessExited { .. })));
        assert!(matches!(handle.read_response(), Err(Error::ProcessExited { .. })));
    }
}
