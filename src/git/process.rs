use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use super::fast_import;
use super::handle::FastImportBackend;

/// How long an importer gets to exit after its input is closed.
const EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// A running `git fast-import` for one repository.
///
/// Standard output carries both `progress` echoes and `ls` answers. A
/// forwarding thread appends the former to the repository log and hands the
/// latter back over a channel, so the pipe never fills up while the
/// orchestrator is busy writing.
pub struct FastImportProcess {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    responses: Receiver<String>,
    forwarder: Option<JoinHandle<()>>,
}

impl FastImportProcess {
    pub fn spawn(
        git: &Path,
        git_dir: &Path,
        marks_file: &str,
        log_path: &Path,
    ) -> io::Result<Self> {
        let log = open_log(log_path)?;
        let mut child = Command::new(git)
            .current_dir(git_dir)
            .arg("fast-import")
            .arg(format!("--import-marks-if-exists={marks_file}"))
            .arg(format!("--export-marks={marks_file}"))
            .arg("--force")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log.try_clone()?))
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("could not connect standard input"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("could not capture standard output"))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let forwarder = std::thread::Builder::new()
            .name("git-fast-import-stdout".into())
            .spawn(move || forward_output(BufReader::new(stdout), log, tx))?;

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            responses: rx,
            forwarder: Some(forwarder),
        })
    }

    fn stdin(&mut self) -> io::Result<&mut BufWriter<ChildStdin>> {
        self.stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "standard input is closed"))
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn forward_output<R: BufRead>(reader: R, mut log: File, responses: Sender<String>) {
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if fast_import::is_ls_response(&line) {
            // The receiver is gone only when the process is being torn down.
            let _ = responses.send(line);
        } else if writeln!(log, "{line}").is_err() {
            tracing::warn!("failed to append to import log: {line}");
        }
    }
}

impl FastImportBackend for FastImportProcess {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stdin()?.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin()?.flush()
    }

    fn answers_queries(&self) -> bool {
        true
    }

    fn read_response(&mut self) -> io::Result<Option<String>> {
        self.flush()?;
        Ok(self.responses.recv().ok())
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            fast_import::checkpoint(&mut stdin)?;
            stdin.flush()?;
        }

        let deadline = Instant::now() + EXIT_TIMEOUT;
        loop {
            if self.child.try_wait()?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                self.child.kill()?;
                if self.child.wait().is_err() {
                    tracing::warn!("git-fast-import did not die");
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        if let Some(forwarder) = self.forwarder.take() {
            if forwarder.join().is_err() {
                tracing::warn!("git-fast-import output forwarder panicked");
            }
        }
        Ok(())
    }
}
