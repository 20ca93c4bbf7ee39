//! Block storage backends.
//!
//! A [`BlockStorage`] persists the blocks of one core. Local cores store a
//! contiguous prefix; remote cores use the same storage as a sparse cache of
//! verified blocks.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Persistence boundary for the blocks of a single core.
pub trait BlockStorage: Send + Sync {
    /// Write `blocks` at consecutive indices starting at `first`. Either all
    /// of them become readable or none do.
    fn write(&self, first: u64, blocks: &[Bytes]) -> CoreResult<()>;

    /// Read one block, `None` if it was never stored.
    fn read(&self, index: u64) -> CoreResult<Option<Bytes>>;

    /// Whether a block is stored.
    fn contains(&self, index: u64) -> bool;

    /// Length of the contiguous prefix `0..n` that is fully stored.
    fn contiguous_len(&self) -> u64;

    /// Flush buffered writes to the OS (and disk, if configured).
    fn flush(&self) -> CoreResult<()>;
}

/// Volatile storage for tests and ephemeral stores.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blocks: RwLock<HashMap<u64, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStorage for MemoryStorage {
    fn write(&self, first: u64, blocks: &[Bytes]) -> CoreResult<()> {
        let mut map = self.blocks.write().expect("storage lock poisoned");
        for (i, block) in blocks.iter().enumerate() {
            map.insert(first + i as u64, block.clone());
        }
        Ok(())
    }

    fn read(&self, index: u64) -> CoreResult<Option<Bytes>> {
        Ok(self
            .blocks
            .read()
            .expect("storage lock poisoned")
            .get(&index)
            .cloned())
    }

    fn contains(&self, index: u64) -> bool {
        self.blocks
            .read()
            .expect("storage lock poisoned")
            .contains_key(&index)
    }

    fn contiguous_len(&self) -> u64 {
        let map = self.blocks.read().expect("storage lock poisoned");
        let mut n = 0u64;
        while map.contains_key(&n) {
            n += 1;
        }
        n
    }

    fn flush(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Flush strategy for file storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every write (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering.
    #[default]
    OsDefault,
}

/// Record header: index (u64) + payload length (u32) + CRC32 (u32).
const HEADER_SIZE: u64 = 16;

/// Largest block a record may hold.
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

struct Writer {
    writer: BufWriter<File>,
    /// Current end of the segment file.
    offset: u64,
}

/// Append-only segment file holding the blocks of one core.
///
/// On-disk record format:
/// ```text
/// [8 bytes: block index (little-endian u64)]
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 over index bytes + payload (little-endian u32)]
/// [N bytes: payload]
/// ```
/// On open the file is scanned front to back; records failing the CRC are
/// skipped and a torn tail is cut off.
pub struct FileStorage {
    path: PathBuf,
    writer: Mutex<Writer>,
    reader: Mutex<BufReader<File>>,
    /// Block index -> (payload offset, payload length).
    index: RwLock<HashMap<u64, (u64, u32)>>,
    sync_mode: SyncMode,
}

impl FileStorage {
    /// Open (or create) a segment file and rebuild its index.
    pub fn open(path: &Path, sync_mode: SyncMode) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let (index, good_len) = recover(path)?;
        let file_len = file.metadata()?.len();
        if good_len < file_len {
            warn!(path = %path.display(), good_len, file_len, "cutting torn tail from block file");
            file.set_len(good_len)?;
        }

        let reader = BufReader::new(File::open(path)?);
        debug!(path = %path.display(), blocks = index.len(), "block file opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Writer {
                writer: BufWriter::new(file),
                offset: good_len,
            }),
            reader: Mutex::new(reader),
            index: RwLock::new(index),
            sync_mode,
        })
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_records(w: &mut Writer, first: u64, blocks: &[Bytes]) -> io::Result<Vec<(u64, u64, u32)>> {
        let mut placed = Vec::with_capacity(blocks.len());
        let mut offset = w.offset;
        for (i, block) in blocks.iter().enumerate() {
            let index = first + i as u64;
            let length = block.len() as u32;
            let mut crc = crc32fast::Hasher::new();
            crc.update(&index.to_le_bytes());
            crc.update(block);

            w.writer.write_all(&index.to_le_bytes())?;
            w.writer.write_all(&length.to_le_bytes())?;
            w.writer.write_all(&crc.finalize().to_le_bytes())?;
            w.writer.write_all(block)?;

            placed.push((index, offset + HEADER_SIZE, length));
            offset += HEADER_SIZE + block.len() as u64;
        }
        w.writer.flush()?;
        Ok(placed)
    }
}

impl BlockStorage for FileStorage {
    fn write(&self, first: u64, blocks: &[Bytes]) -> CoreResult<()> {
        if let Some(big) = blocks.iter().find(|b| b.len() > MAX_BLOCK_SIZE) {
            return Err(CoreError::Storage(format!(
                "block of {} bytes exceeds maximum {MAX_BLOCK_SIZE}",
                big.len()
            )));
        }

        let mut w = self.writer.lock().expect("block file mutex poisoned");
        let start = w.offset;
        let placed = match Self::write_records(&mut w, first, blocks) {
            Ok(placed) => placed,
            Err(e) => {
                // Drop the partial batch so a reopen cannot resurrect it.
                let _ = w.writer.get_ref().set_len(start);
                return Err(e.into());
            }
        };
        if self.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_all()?;
        }
        if let Some((_, end, len)) = placed.last() {
            w.offset = end + *len as u64;
        }
        drop(w);

        let mut index = self.index.write().expect("block index lock poisoned");
        for (block, offset, len) in placed {
            index.insert(block, (offset, len));
        }
        debug!(first, count = blocks.len(), "blocks written");
        Ok(())
    }

    fn read(&self, index: u64) -> CoreResult<Option<Bytes>> {
        let location = self
            .index
            .read()
            .expect("block index lock poisoned")
            .get(&index)
            .copied();
        let Some((offset, len)) = location else {
            return Ok(None);
        };

        let mut reader = self.reader.lock().expect("block file mutex poisoned");
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        Ok(Some(Bytes::from(buf)))
    }

    fn contains(&self, index: u64) -> bool {
        self.index
            .read()
            .expect("block index lock poisoned")
            .contains_key(&index)
    }

    fn contiguous_len(&self) -> u64 {
        let index = self.index.read().expect("block index lock poisoned");
        let mut n = 0u64;
        while index.contains_key(&n) {
            n += 1;
        }
        n
    }

    fn flush(&self) -> CoreResult<()> {
        let mut w = self.writer.lock().expect("block file mutex poisoned");
        w.writer.flush()?;
        w.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Scan a segment file. Returns the block index and the length of the
/// well-formed prefix of the file.
fn recover(path: &Path) -> CoreResult<(HashMap<u64, (u64, u32)>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut index = HashMap::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let block = u64::from_le_bytes(header[0..8].try_into().expect("8-byte slice"));
        let length = u32::from_le_bytes(header[8..12].try_into().expect("4-byte slice"));
        let expected_crc = u32::from_le_bytes(header[12..16].try_into().expect("4-byte slice"));

        if length as usize > MAX_BLOCK_SIZE || offset + HEADER_SIZE + length as u64 > file_len {
            warn!(offset, length, file_len, "invalid block record; stopping recovery");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated block record; stopping recovery");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let mut crc = crc32fast::Hasher::new();
        crc.update(&block.to_le_bytes());
        crc.update(&payload);
        let actual_crc = crc.finalize();
        if actual_crc != expected_crc {
            warn!(offset, block, expected = expected_crc, actual = actual_crc, "CRC mismatch; skipping block");
        } else {
            index.insert(block, (offset + HEADER_SIZE, length));
        }
        offset += HEADER_SIZE + length as u64;
    }

    debug!(recovered = index.len(), "block file recovery complete");
    Ok((index, offset))
}
