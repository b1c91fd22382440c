use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::handle::FastImportBackend;

/// Importer stand-in for dry runs: the command stream is written to `out`
/// (normally the repository log, which keeps it replayable for resume) and
/// nothing is imported.
///
/// A sink can be given canned `ls` answers; without them it does not answer
/// queries at all.
pub struct DryRunSink {
    out: Box<dyn Write>,
    responses: Option<VecDeque<String>>,
    closed: bool,
}

impl DryRunSink {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            responses: None,
            closed: false,
        }
    }

    /// Append the stream to the file at `path`.
    pub fn to_file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(BufWriter::new(file))))
    }

    /// Answer `ls` queries with these raw response lines, in order.
    pub fn with_responses<I, S>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responses = Some(responses.into_iter().map(Into::into).collect());
        self
    }

    /// Answer `ls ""` queries with these root tree ids, in order.
    pub fn with_trees<I, S>(self, trees: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines: Vec<String> = trees
            .into_iter()
            .map(|sha| format!("040000 tree {}\t", sha.as_ref()))
            .collect();
        self.with_responses(lines)
    }
}

impl FastImportBackend for DryRunSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    fn answers_queries(&self) -> bool {
        self.responses.is_some()
    }

    fn read_response(&mut self) -> io::Result<Option<String>> {
        Ok(self.responses.as_mut().and_then(VecDeque::pop_front))
    }

    fn is_running(&mut self) -> bool {
        !self.closed
    }

    fn close(&mut self) -> io::Result<()> {
        self.out.write_all(b"checkpoint\n")?;
        self.closed = true;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_writes_to_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log-a");
        let mut sink = DryRunSink::to_file(&path)?;
        sink.write_all(b"progress hello\n")?;
        assert!(!sink.answers_queries());
        sink.close()?;
        assert!(!sink.is_running());
        assert_eq!(std::fs::read_to_string(&path)?, "progress hello\ncheckpoint\n");
        Ok(())
    }

    #[test]
    fn test_canned_trees() -> anyhow::Result<()> {
        let mut sink = DryRunSink::new(Box::new(io::sink())).with_trees(["a".repeat(40)]);
        assert!(sink.answers_queries());
        let line = sink.read_response()?.unwrap();
        assert_eq!(line, format!("040000 tree {}\t", "a".repeat(40)));
        assert_eq!(sink.read_response()?, None);
        Ok(())
    }
}
