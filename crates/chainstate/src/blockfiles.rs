//! The flat-file sequence a full node writes: `blk00000.dat`,
//! `blk00001.dat`, … presented as an append-mostly byte stream with
//! positional random access.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use scrydb_consensus::Hash256;
use scrydb_log::{log_info, log_warn};
use scrydb_primitives::block::HEADER_SIZE;
use scrydb_primitives::encoding::Decoder;
use scrydb_primitives::hash::sha256d;

/// Smallest file that can hold a first header: magic + size + header.
const MIN_HEADER_FILE_SIZE: u64 = 88;
/// Magic + size framing around every raw block.
const BLOCK_FRAME_SIZE: u64 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BlockFilePosition {
    pub file_num: u32,
    pub offset: u64,
}

impl BlockFilePosition {
    pub const START: BlockFilePosition = BlockFilePosition {
        file_num: 0,
        offset: 0,
    };

    pub fn new(file_num: u32, offset: u64) -> Self {
        Self { file_num, offset }
    }
}

#[derive(Debug)]
pub enum BlockFileError {
    Io {
        file_num: u32,
        source: std::io::Error,
    },
    WrongNetwork {
        file_num: u32,
        found: [u8; 4],
    },
    OutOfRange(u32),
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io { file_num, source } => {
                write!(f, "block file {file_num}: {source}")
            }
            BlockFileError::WrongNetwork { file_num, found } => write!(
                f,
                "block file {file_num} is for another network (magic {:02x}{:02x}{:02x}{:02x})",
                found[0], found[1], found[2], found[3]
            ),
            BlockFileError::OutOfRange(file_num) => {
                write!(f, "block file {file_num} out of range")
            }
        }
    }
}

impl std::error::Error for BlockFileError {}

/// Scoped read-only mapping of one block file. The map is released when the
/// last clone of the handle drops.
pub struct MappedFile {
    file_num: u32,
    map: Mmap,
}

impl MappedFile {
    pub fn file_num(&self) -> u32 {
        self.file_num
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One header emitted by a header walk.
pub struct HeaderEvent<'a> {
    /// The 80 raw header bytes.
    pub raw_header: &'a [u8],
    /// Offset of the block's magic within its file.
    pub position: BlockFilePosition,
    /// Size of the raw block (framing excluded).
    pub block_size: u32,
    pub num_tx: u32,
}

/// What the header-walk callback wants next.
pub enum ScanControl {
    Continue,
    /// Stop the walk; `read_headers` reports this position.
    StopAt(BlockFilePosition),
    /// Abandon the walk; progress so far is discarded by the caller.
    Abort,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkEnd {
    /// Every file was read to its end; the position is one past the last
    /// block consumed.
    Exhausted(BlockFilePosition),
    Stopped(BlockFilePosition),
    Aborted,
}

#[derive(Clone, Debug)]
struct BlkFile {
    num: u32,
    path: PathBuf,
    size: u64,
}

pub struct BlockFileSet {
    dir: PathBuf,
    magic: [u8; 4],
    files: Vec<BlkFile>,
    total_bytes: u64,
}

impl BlockFileSet {
    pub fn new(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Self {
        Self {
            dir: dir.into(),
            magic,
            files: Vec::new(),
            total_bytes: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scans the directory for `blkNNNNN.dat` without gaps. Re-checks the
    /// last known file for growth and picks up files appended past it, so
    /// `num_files` and `total_bytes` never go backwards.
    pub fn detect(&mut self) -> Result<(), BlockFileError> {
        if let Some(last) = self.files.pop() {
            self.total_bytes -= last.size;
        }
        let mut next = self.files.len() as u32;
        loop {
            let path = blk_file_path(&self.dir, next);
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
                Err(err) => {
                    return Err(BlockFileError::Io {
                        file_num: next,
                        source: err,
                    })
                }
            };
            self.files.push(BlkFile {
                num: next,
                path,
                size,
            });
            self.total_bytes += size;
            next += 1;
        }
        Ok(())
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn file_size(&self, file_num: u32) -> Option<u64> {
        self.files.get(file_num as usize).map(|f| f.size)
    }

    fn file(&self, file_num: u32) -> Result<&BlkFile, BlockFileError> {
        self.files
            .get(file_num as usize)
            .ok_or(BlockFileError::OutOfRange(file_num))
    }

    /// Maps a file read-only. The caller may share the handle freely but
    /// must not hold it past the batch that needed it.
    pub fn map(&self, file_num: u32) -> Result<Arc<MappedFile>, BlockFileError> {
        let blk_file = self.file(file_num)?;
        let io_err = |source| BlockFileError::Io { file_num, source };
        if blk_file.size == 0 {
            return Err(io_err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "block file is empty",
            )));
        }
        let file = File::open(&blk_file.path).map_err(io_err)?;
        let map = unsafe { Mmap::map(&file) }.map_err(io_err)?;
        Ok(Arc::new(MappedFile { file_num, map }))
    }

    /// Hash of the first header in a file, used to align header ingest
    /// across files without reading them whole. `None` means the file holds
    /// no complete header yet.
    pub fn first_hash(&self, file_num: u32) -> Result<Option<Hash256>, BlockFileError> {
        let blk_file = self.file(file_num)?;
        if blk_file.size < MIN_HEADER_FILE_SIZE {
            log_info!(
                "block file {} is smaller than {} bytes, no headers yet",
                file_num,
                MIN_HEADER_FILE_SIZE
            );
            return Ok(None);
        }
        let map = self.map(file_num)?;
        let bytes = map.bytes();
        if bytes[..4] != self.magic {
            let mut found = [0u8; 4];
            found.copy_from_slice(&bytes[..4]);
            return Err(BlockFileError::WrongNetwork { file_num, found });
        }
        Ok(Some(sha256d(&bytes[8..8 + HEADER_SIZE])))
    }

    /// Walks headers file by file from `start`. A wrong-network file ends
    /// the walk as if that file and everything past it were absent.
    pub fn read_headers(
        &self,
        start: BlockFilePosition,
        callback: &mut dyn FnMut(&HeaderEvent) -> ScanControl,
    ) -> Result<WalkEnd, BlockFileError> {
        let mut position = start;
        for file_num in start.file_num..self.files.len() as u32 {
            let offset = if file_num == start.file_num {
                start.offset
            } else {
                0
            };
            match self.read_headers_in_file(file_num, offset, callback) {
                Ok(WalkEnd::Exhausted(end)) => position = end,
                Ok(done) => return Ok(done),
                Err(BlockFileError::WrongNetwork { found, .. }) => {
                    log_warn!(
                        "block file {} is for another network \
                         (magic {:02x}{:02x}{:02x}{:02x}), ignoring it and later files",
                        file_num,
                        found[0],
                        found[1],
                        found[2],
                        found[3]
                    );
                    return Ok(WalkEnd::Exhausted(position));
                }
                Err(BlockFileError::Io { file_num, source }) => {
                    log_warn!("block file {file_num} is unreadable ({source}), stopping here");
                    return Ok(WalkEnd::Exhausted(position));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(WalkEnd::Exhausted(position))
    }

    /// Walks the headers of one file starting at `offset`, resyncing past
    /// non-magic bytes.
    pub fn read_headers_in_file(
        &self,
        file_num: u32,
        offset: u64,
        callback: &mut dyn FnMut(&HeaderEvent) -> ScanControl,
    ) -> Result<WalkEnd, BlockFileError> {
        let blk_file = self.file(file_num)?;
        if blk_file.size < MIN_HEADER_FILE_SIZE {
            // no complete header yet; the node is still writing it
            return Ok(WalkEnd::Exhausted(BlockFilePosition::new(file_num, offset)));
        }

        let map = self.map(file_num)?;
        let bytes = map.bytes();
        if bytes[..4] != self.magic {
            let mut found = [0u8; 4];
            found.copy_from_slice(&bytes[..4]);
            return Err(BlockFileError::WrongNetwork { file_num, found });
        }

        let size = bytes.len() as u64;
        let mut pos = offset;
        while pos + BLOCK_FRAME_SIZE <= size {
            if bytes[pos as usize..pos as usize + 4] != self.magic {
                match scan_for_magic(bytes, pos as usize, &self.magic) {
                    Some(found) => {
                        log_warn!(
                            "block file {}: misaligned data at offset {}, next block at {}",
                            file_num,
                            pos,
                            found
                        );
                        pos = found as u64;
                        continue;
                    }
                    None => {
                        log_warn!(
                            "block file {}: no more blocks after offset {}",
                            file_num,
                            pos
                        );
                        break;
                    }
                }
            }

            let size_at = pos as usize + 4;
            let block_size = u32::from_le_bytes([
                bytes[size_at],
                bytes[size_at + 1],
                bytes[size_at + 2],
                bytes[size_at + 3],
            ]);
            let body_start = pos + BLOCK_FRAME_SIZE;
            if (block_size as u64) < HEADER_SIZE as u64 + 1 {
                log_warn!(
                    "block file {}: implausible block size {} at offset {}",
                    file_num,
                    block_size,
                    pos
                );
                pos += 4;
                continue;
            }
            if body_start + block_size as u64 > size {
                // in-progress write at the tail; stop cleanly
                break;
            }

            let body = &bytes[body_start as usize..(body_start + block_size as u64) as usize];
            let mut decoder = Decoder::new(&body[HEADER_SIZE..]);
            let num_tx = match decoder.read_varint() {
                Ok(count) => count as u32,
                Err(_) => {
                    log_warn!(
                        "block file {}: unreadable tx count at offset {}",
                        file_num,
                        pos
                    );
                    pos += 4;
                    continue;
                }
            };

            let event = HeaderEvent {
                raw_header: &body[..HEADER_SIZE],
                position: BlockFilePosition::new(file_num, pos),
                block_size,
                num_tx,
            };
            match callback(&event) {
                ScanControl::Continue => {}
                ScanControl::StopAt(stop) => return Ok(WalkEnd::Stopped(stop)),
                ScanControl::Abort => return Ok(WalkEnd::Aborted),
            }
            pos = body_start + block_size as u64;
        }

        Ok(WalkEnd::Exhausted(BlockFilePosition::new(file_num, pos)))
    }
}

pub fn blk_file_path(dir: &Path, file_num: u32) -> PathBuf {
    dir.join(format!("blk{file_num:05}.dat"))
}

/// Byte-by-byte forward scan for the next magic occurrence at or after
/// `from`. Returns the absolute offset of the match.
pub fn scan_for_magic(bytes: &[u8], from: usize, magic: &[u8; 4]) -> Option<usize> {
    if bytes.len() < 4 {
        return None;
    }
    (from..=bytes.len() - 4).find(|&at| &bytes[at..at + 4] == magic)
}
