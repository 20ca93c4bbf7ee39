//! In-memory index over a drive's metadata log.
//!
//! Every key keeps its full write history as `(seq, value)` pairs so any
//! checkout length can be answered without replaying the log.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use tidal_core::Core;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DriveError, DriveResult};
use crate::node::{Entry, EntryValue, Header, Node};

type History<T> = Vec<(u64, Option<T>)>;

/// Last value in `history` written strictly before `length`.
fn visible<T>(history: &History<T>, length: u64) -> Option<(u64, &T)> {
    let end = history.partition_point(|(seq, _)| *seq < length);
    let (seq, value) = history[..end].last()?;
    value.as_ref().map(|v| (*seq, v))
}

#[derive(Debug, Default)]
pub(crate) struct Index {
    /// Number of metadata blocks consumed.
    indexed: u64,
    headers: History<Header>,
    entries: BTreeMap<String, History<EntryValue>>,
    settings: BTreeMap<String, History<String>>,
    /// One past the highest blob block any put has referenced.
    blob_end: u64,
}

impl Index {
    pub(crate) fn indexed(&self) -> u64 {
        self.indexed
    }

    pub(crate) fn blob_end(&self) -> u64 {
        self.blob_end
    }

    fn apply(&mut self, seq: u64, node: Node) -> DriveResult<()> {
        if seq == 0 && !matches!(node, Node::Header(_)) {
            return Err(DriveError::CorruptNode {
                index: 0,
                reason: "metadata log does not start with a header".into(),
            });
        }
        match node {
            Node::Header(header) => self.headers.push((seq, Some(header))),
            Node::Put { key, value } => {
                if let EntryValue::Blob { blob, .. } = &value {
                    self.blob_end = self.blob_end.max(blob.end_block());
                }
                self.entries.entry(key).or_default().push((seq, Some(value)));
            }
            Node::Del { key } => self.entries.entry(key).or_default().push((seq, None)),
            Node::Setting { name, value } => self.settings.entry(name).or_default().push((seq, value)),
        }
        self.indexed = seq + 1;
        Ok(())
    }

    /// Latest header at `length`.
    pub(crate) fn header(&self, length: u64) -> Option<&Header> {
        visible(&self.headers, length).map(|(_, h)| h)
    }

    pub(crate) fn entry(&self, key: &str, length: u64) -> Option<Entry> {
        let history = self.entries.get(key)?;
        visible(history, length).map(|(seq, value)| Entry {
            key: key.to_string(),
            value: value.clone(),
            seq,
        })
    }

    /// First live entry with key strictly after `after` (or the first at all).
    fn next_entry(&self, after: Option<&str>, length: u64) -> Option<Entry> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.entries
            .range::<str, _>((lower, Bound::Unbounded))
            .find_map(|(key, history)| {
                visible(history, length).map(|(seq, value)| Entry {
                    key: key.clone(),
                    value: value.clone(),
                    seq,
                })
            })
    }

    pub(crate) fn setting(&self, name: &str, length: u64) -> Option<&str> {
        let history = self.settings.get(name)?;
        visible(history, length).map(|(_, v)| v.as_str())
    }

    pub(crate) fn setting_names(&self, length: u64) -> Vec<String> {
        self.settings
            .iter()
            .filter(|(_, history)| visible(history, length).is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Index shared between a drive and its checkouts.
#[derive(Clone, Default)]
pub(crate) struct SharedIndex {
    index: Arc<RwLock<Index>>,
    /// Serializes catch-up so blocks are applied exactly once, in order.
    sync: Arc<Mutex<()>>,
}

impl SharedIndex {
    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().expect("drive index poisoned")
    }

    /// Apply every metadata block up to `metadata.length()`.
    pub(crate) async fn catch_up(&self, metadata: &Core) -> DriveResult<u64> {
        let _guard = self.sync.lock().await;
        let from = self.read().indexed;
        let to = metadata.length();
        if from >= to {
            return Ok(from);
        }

        let mut nodes = Vec::with_capacity((to - from) as usize);
        for seq in from..to {
            let block = metadata.get(seq).await?;
            nodes.push((seq, Node::decode(seq, &block)?));
        }

        let mut index = self.index.write().expect("drive index poisoned");
        for (seq, node) in nodes {
            index.apply(seq, node)?;
        }
        debug!(from, to, "drive index caught up");
        Ok(to)
    }
}

/// Lazy iterator over the live entries of a drive in ascending key order.
///
/// Each step looks up the next key in the shared index, so iteration never
/// copies the whole tree. Cloning or calling [`Entries::rewind`] restarts it.
#[derive(Clone)]
pub struct Entries {
    index: SharedIndex,
    length: u64,
    cursor: Option<String>,
    done: bool,
}

impl Entries {
    pub(crate) fn new(index: SharedIndex, length: u64) -> Self {
        Self {
            index,
            length,
            cursor: None,
            done: false,
        }
    }

    /// Restart from the smallest key.
    pub fn rewind(&mut self) {
        self.cursor = None;
        self.done = false;
    }

    /// Look at the next entry without consuming it.
    pub fn peek(&self) -> Option<Entry> {
        if self.done {
            return None;
        }
        self.index
            .read()
            .next_entry(self.cursor.as_deref(), self.length)
    }
}

impl Iterator for Entries {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let entry = self.peek();
        match &entry {
            Some(e) => self.cursor = Some(e.key.clone()),
            None => self.done = true,
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DRIVE_VERSION;
    use tidal_types::CoreKey;

    fn header() -> Node {
        Node::Header(Header {
            version: DRIVE_VERSION,
            blobs_key: CoreKey::ephemeral(),
        })
    }

    fn put(key: &str, value: &'static [u8]) -> Node {
        Node::Put {
            key: key.into(),
            value: EntryValue::inline(value),
        }
    }

    fn index_of(nodes: Vec<Node>) -> Index {
        let mut index = Index::default();
        for (seq, node) in nodes.into_iter().enumerate() {
            index.apply(seq as u64, node).unwrap();
        }
        index
    }

    #[test]
    fn visibility_respects_length() {
        let index = index_of(vec![
            header(),
            put("/a", b"1"),
            Node::Del { key: "/a".into() },
            put("/a", b"2"),
        ]);
        assert!(index.entry("/a", 1).is_none());
        assert_eq!(index.entry("/a", 2).unwrap().value, EntryValue::inline(&b"1"[..]));
        assert!(index.entry("/a", 3).is_none());
        let latest = index.entry("/a", 4).unwrap();
        assert_eq!(latest.seq, 3);
        assert_eq!(latest.value, EntryValue::inline(&b"2"[..]));
    }

    #[test]
    fn first_block_must_be_header() {
        let mut index = Index::default();
        assert!(matches!(
            index.apply(0, put("/a", b"1")),
            Err(DriveError::CorruptNode { index: 0, .. })
        ));
    }

    #[test]
    fn settings_do_not_appear_as_entries() {
        let index = index_of(vec![
            header(),
            Node::Setting {
                name: "channel".into(),
                value: Some("\"beta\"".into()),
            },
        ]);
        assert!(index.next_entry(None, 2).is_none());
        assert_eq!(index.setting("channel", 2), Some("\"beta\""));
        assert_eq!(index.setting_names(2), vec!["channel".to_string()]);
        assert!(index.setting("channel", 1).is_none());
    }

    #[test]
    fn entries_iterate_in_key_order_skipping_tombstones() {
        let shared = SharedIndex::default();
        {
            let mut index = shared.index.write().unwrap();
            for (seq, node) in [
                header(),
                put("/c", b"3"),
                put("/a", b"1"),
                put("/b", b"2"),
                Node::Del { key: "/c".into() },
            ]
            .into_iter()
            .enumerate()
            {
                index.apply(seq as u64, node).unwrap();
            }
        }
        let mut entries = Entries::new(shared.clone(), 5);
        let keys: Vec<_> = entries.by_ref().map(|e| e.key).collect();
        assert_eq!(keys, vec!["/a", "/b"]);
        assert!(entries.next().is_none());

        entries.rewind();
        assert_eq!(entries.next().unwrap().key, "/a");

        let at_four: Vec<_> = Entries::new(shared, 4).map(|e| e.key).collect();
        assert_eq!(at_four, vec!["/a", "/b", "/c"]);
    }
}
