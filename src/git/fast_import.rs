//! Rendering of git fast-import commands.
//!
//! Every function appends one complete command (or directive) to a byte
//! buffer. Callers batch the buffer and hand it to the importer backend in
//! one write, so a command is never split across two backend calls.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};

use crate::repository::{Mark, Revnum};

/// Object id fast-import treats as "no commit"; resetting a ref to it deletes
/// the ref.
pub const NULL_SHA: &str = "0000000000000000000000000000000000000000";

/// Git file mode of a submodule (gitlink) entry.
pub const GITLINK_MODE: u32 = 0o160000;

/// Ref the metadata notes are committed to.
pub const NOTES_REF: &str = "refs/notes/commits";

/// Marker left in log messages of commits synthesized by cvs2svn.
pub const CVS2SVN_MARKER: &str = "This commit was manufactured by cvs2svn";

/// Something a `from`/`merge` line can point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRef {
    Mark(Mark),
    Ref(String),
    Null,
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitRef::Mark(mark) => write!(f, ":{mark}"),
            CommitRef::Ref(name) => f.write_str(name),
            CommitRef::Null => f.write_str(NULL_SHA),
        }
    }
}

/// Quote a path for `M`/`D` directives when fast-import would otherwise
/// misparse it.
pub fn quote_path(path: &str) -> Cow<'_, str> {
    if !path.starts_with('"') && !path.contains('\n') {
        return Cow::Borrowed(path);
    }
    let mut quoted = String::with_capacity(path.len() + 2);
    quoted.push('"');
    for chr in path.chars() {
        match chr {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// `data <len>` followed by exactly `<len>` bytes and a trailing LF.
pub fn data<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    writeln!(out, "data {}", bytes.len())?;
    out.write_all(bytes)?;
    out.write_all(b"\n")
}

pub fn blob<W: Write>(out: &mut W, mark: Mark, content: &[u8]) -> io::Result<()> {
    writeln!(out, "blob")?;
    writeln!(out, "mark :{mark}")?;
    data(out, content)
}

pub fn commit<W: Write>(
    out: &mut W,
    ref_name: &str,
    mark: Mark,
    committer: &str,
    epoch: i64,
    message: &str,
) -> io::Result<()> {
    writeln!(out, "commit {ref_name}")?;
    writeln!(out, "mark :{mark}")?;
    writeln!(out, "committer {committer} {epoch} +0000")?;
    data(out, message.as_bytes())
}

pub fn from<W: Write>(out: &mut W, parent: &CommitRef) -> io::Result<()> {
    writeln!(out, "from {parent}")
}

pub fn merge<W: Write>(out: &mut W, mark: Mark) -> io::Result<()> {
    writeln!(out, "merge :{mark}")
}

pub fn file_delete<W: Write>(out: &mut W, path: &str) -> io::Result<()> {
    writeln!(out, "D {}", quote_path(path))
}

pub fn delete_all<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "deleteall")
}

pub fn file_modify<W: Write>(out: &mut W, mode: u32, mark: Mark, path: &str) -> io::Result<()> {
    writeln!(out, "M {mode:o} :{mark} {}", quote_path(path))
}

/// Gitlink entry carrying a placeholder object id instead of the child's
/// real commit id.
pub fn submodule_modify<W: Write>(out: &mut W, child_mark: Mark, path: &str) -> io::Result<()> {
    writeln!(
        out,
        "M {GITLINK_MODE:o} {} {}",
        placeholder_sha(child_mark),
        quote_path(path)
    )
}

/// The child's mark, zero padded to the width of an object id. Decimal
/// digits keep it readable and are valid hex.
pub fn placeholder_sha(child_mark: Mark) -> String {
    format!("{child_mark:040}")
}

pub fn reset<W: Write>(out: &mut W, ref_name: &str, target: &CommitRef) -> io::Result<()> {
    writeln!(out, "reset {ref_name}")?;
    writeln!(out, "from {target}")?;
    writeln!(out)
}

pub fn progress<W: Write>(out: &mut W, text: &str) -> io::Result<()> {
    writeln!(out, "progress {text}")?;
    writeln!(out)
}

/// The resume-significant progress record for a ref move.
pub fn progress_record(revision: Revnum, ref_name: &str, mark: Mark, comment: &str) -> String {
    if comment.is_empty() {
        format!("SVN r{revision} branch {ref_name} = :{mark}")
    } else {
        format!("SVN r{revision} branch {ref_name} = :{mark} # {comment}")
    }
}

/// Parse one log line as a progress record. Comments (`# ...`) and
/// surrounding whitespace are ignored; anything else yields `None`.
pub fn parse_progress_record(line: &str) -> Option<(Revnum, String, Mark)> {
    let line = match line.find('#') {
        Some(hash) => &line[..hash],
        None => line,
    };
    let rest = line.trim().strip_prefix("progress SVN r")?;
    let (revision, rest) = rest.split_once(" branch ")?;
    let (ref_name, mark) = rest.rsplit_once(" = :")?;
    if ref_name.is_empty() {
        return None;
    }
    let revision = parse_digits(revision)?;
    let mark = parse_digits(mark)?;
    Some((revision, ref_name.to_string(), mark))
}

fn parse_digits(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

pub fn tag<W: Write>(
    out: &mut W,
    name: &str,
    from_ref: &str,
    tagger: &str,
    epoch: i64,
    message: &str,
) -> io::Result<()> {
    writeln!(out, "tag {name}")?;
    writeln!(out, "from {from_ref}")?;
    writeln!(out, "tagger {tagger} {epoch} +0000")?;
    data(out, message.as_bytes())
}

/// A commit on the notes ref attaching `text` to `target`.
pub fn note<W: Write>(
    out: &mut W,
    notes_mark: Mark,
    committer: &str,
    epoch: i64,
    message: &str,
    target: &str,
    text: &str,
) -> io::Result<()> {
    commit(out, NOTES_REF, notes_mark, committer, epoch, message)?;
    writeln!(out, "N inline {target}")?;
    data(out, text.as_bytes())
}

pub fn checkpoint<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "checkpoint")
}

/// Ask for the root tree of the commit currently being built.
pub fn ls_root<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "ls \"\"")
}

/// Ask for the root tree of an already imported commit.
pub fn ls_commit_root<W: Write>(out: &mut W, mark: Mark) -> io::Result<()> {
    writeln!(out, "ls :{mark} \"\"")
}

/// Whether a line on fast-import's output channel answers an `ls` query.
pub fn is_ls_response(line: &str) -> bool {
    if line.starts_with("missing ") {
        return true;
    }
    let mut fields = line.splitn(3, ' ');
    let mode = fields.next().unwrap_or_default();
    let kind = fields.next().unwrap_or_default();
    mode.len() == 6
        && mode.bytes().all(|b| b.is_ascii_digit())
        && matches!(kind, "tree" | "blob" | "commit")
}

/// Extract the tree id from the response to `ls ""`: the 40 characters in
/// front of the tab that separates the (empty) path.
pub fn parse_ls_root_response(line: &str) -> Option<String> {
    let line = line.strip_suffix('\t')?;
    if line.len() < 40 || !is_ls_response(line) {
        return None;
    }
    let sha = &line[line.len() - 40..];
    sha.bytes()
        .all(|b| b.is_ascii_hexdigit())
        .then(|| sha.to_string())
}

/// `svn path=<prefix>; revision=<rev>[; tag=<name>]` trailer.
pub fn metadata_message(svn_prefix: &str, revision: Revnum, tag: &str) -> String {
    let mut msg = format!("svn path={svn_prefix}; revision={revision}");
    if !tag.is_empty() {
        msg.push_str("; tag=");
        msg.push_str(tag);
    }
    msg.push('\n');
    msg
}
