//! Reading the mark index fast-import exports (`:<mark> <sha>` per line).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::repository::Mark;
use crate::Result;

/// Why scanning stopped before the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    NotNumeric,
    Duplicate,
    Unsorted,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarkScan {
    /// Highest mark of the contiguous run starting at :1 before any
    /// corruption.
    pub contiguous_through: Mark,
    /// Line number (1-based) and reason of the first corrupt line.
    pub corruption: Option<(usize, Corruption)>,
}

impl MarkScan {
    /// The last mark resume may trust. A corrupt index is not trusted at all.
    pub fn last_valid_mark(&self) -> Mark {
        if self.corruption.is_some() {
            0
        } else {
            self.contiguous_through
        }
    }
}

/// Scan a mark index. Scanning stops at the first gap, since commit marks are
/// allocated contiguously from 1 and everything past a gap is file marks.
pub fn scan_lines<I, S>(lines: I) -> MarkScan
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut prev_mark: Mark = 0;
    for (idx, line) in lines.into_iter().enumerate() {
        let line = line.as_ref();
        if line.is_empty() {
            continue;
        }

        let mark = line
            .strip_prefix(':')
            .and_then(|rest| rest.split_once(' '))
            .and_then(|(digits, _)| digits.parse::<Mark>().ok())
            .unwrap_or(0);

        let corruption = if mark == 0 {
            Some(Corruption::NotNumeric)
        } else if mark == prev_mark {
            Some(Corruption::Duplicate)
        } else if mark < prev_mark {
            Some(Corruption::Unsorted)
        } else {
            None
        };
        if let Some(kind) = corruption {
            return MarkScan {
                contiguous_through: prev_mark,
                corruption: Some((idx + 1, kind)),
            };
        }

        if mark > prev_mark + 1 {
            break;
        }
        prev_mark = mark;
    }
    MarkScan {
        contiguous_through: prev_mark,
        corruption: None,
    }
}

/// Scan the mark index at `path`; a missing file scans as empty.
pub fn scan_file(path: &Path) -> Result<MarkScan> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MarkScan::default()),
        Err(e) => return Err(e.into()),
    };
    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?;
    let scan = scan_lines(&lines);
    if let Some((line, kind)) = scan.corruption {
        tracing::warn!(
            "{} line {}: marks file corrupt ({:?}); ignoring it",
            path.display(),
            line,
            kind
        );
    }
    Ok(scan)
}
