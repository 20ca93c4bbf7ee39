//! Key-level diff between two drives.
//!
//! Both drives' entries are walked together in ascending key order, so the
//! diff is produced in key order without materializing either tree.

use std::cmp::Ordering;
use std::fmt;

use tidal_drive::{Drive, Entries, Entry, EntryValue};

use crate::error::MirrorResult;

/// Kind of difference for one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiffOp {
    /// Key only in the source.
    Add,
    /// Key only in the destination.
    Remove,
    /// Key in both with different content.
    Change,
}

impl DiffOp {
    /// One-character marker used in progress output.
    pub fn symbol(&self) -> char {
        match self {
            Self::Add => '+',
            Self::Remove => '-',
            Self::Change => '~',
        }
    }
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
            Self::Change => write!(f, "change"),
        }
    }
}

/// One difference, as reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffRecord {
    pub key: String,
    pub op: DiffOp,
    pub bytes_added: u64,
    pub bytes_removed: u64,
}

/// A record together with the source value needed to apply it.
#[derive(Clone, Debug)]
pub(crate) struct Change {
    pub record: DiffRecord,
    /// Source value for `Add` and `Change`.
    pub source: Option<EntryValue>,
}

impl Change {
    fn add(entry: Entry) -> Self {
        Self {
            record: DiffRecord {
                key: entry.key,
                op: DiffOp::Add,
                bytes_added: entry.value.len(),
                bytes_removed: 0,
            },
            source: Some(entry.value),
        }
    }

    fn remove(entry: Entry) -> Self {
        Self {
            record: DiffRecord {
                key: entry.key,
                op: DiffOp::Remove,
                bytes_added: 0,
                bytes_removed: entry.value.len(),
            },
            source: None,
        }
    }

    fn change(src: Entry, dst: Entry) -> Self {
        Self {
            record: DiffRecord {
                key: src.key,
                op: DiffOp::Change,
                bytes_added: src.value.len(),
                bytes_removed: dst.value.len(),
            },
            source: Some(src.value),
        }
    }
}

/// Ordered merge of two entry streams.
pub(crate) struct DiffWalk {
    src: Entries,
    dst: Entries,
}

impl DiffWalk {
    pub(crate) async fn new(src: &Drive, dst: &Drive) -> MirrorResult<Self> {
        Ok(Self {
            src: src.entries().await?,
            dst: dst.entries().await?,
        })
    }
}

impl Iterator for DiffWalk {
    type Item = Change;

    fn next(&mut self) -> Option<Change> {
        loop {
            let order = match (self.src.peek(), self.dst.peek()) {
                (None, None) => return None,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(s), Some(d)) => s.key.cmp(&d.key),
            };
            match order {
                Ordering::Less => return self.src.next().map(Change::add),
                Ordering::Greater => return self.dst.next().map(Change::remove),
                Ordering::Equal => {
                    let (s, d) = (self.src.next()?, self.dst.next()?);
                    if !s.value.same_content(&d.value) {
                        return Some(Change::change(s, d));
                    }
                }
            }
        }
    }
}

/// Full diff from `src` to `dst`, in ascending key order. Reads no blob
/// bytes.
pub async fn diff(src: &Drive, dst: &Drive) -> MirrorResult<Vec<DiffRecord>> {
    Ok(DiffWalk::new(src, dst).await?.map(|c| c.record).collect())
}
