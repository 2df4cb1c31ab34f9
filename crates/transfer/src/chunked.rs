use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::{DEFAULT_BLOCK_SIZE, TransferError, validate_cache_key};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Fails with [`TransferError::ChecksumMismatch`] unless `data` hashes to
/// `expected`. An empty `expected` skips the check.
pub fn verify_checksum(index: u32, data: &[u8], expected: &str) -> Result<(), TransferError> {
    if expected.is_empty() || checksum_bytes(data).eq_ignore_ascii_case(expected) {
        return Ok(());
    }
    Err(TransferError::ChecksumMismatch { index })
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// One block of cleartext read from a source file.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Splits a file into sequential blocks of at most `block_size` bytes.
pub struct ChunkReader {
    file: std::fs::File,
    block_size: usize,
    offset: u64,
    index: u32,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for block reading.
    ///
    /// If `block_size` is 0, [`DEFAULT_BLOCK_SIZE`] is used.
    pub fn new(path: &Path, block_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let block_size = if block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };
        Ok(Self {
            file,
            block_size,
            offset: 0,
            index: 0,
            file_size,
        })
    }

    /// Number of blocks the file splits into. An empty file has none.
    pub fn block_count(&self) -> u32 {
        self.file_size.div_ceil(self.block_size as u64) as u32
    }

    /// Reads the next block. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.file_size.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.block_size as u64) as usize;
        let mut buf = vec![0u8; read_size];
        self.file.read_exact(&mut buf)?;

        let chunk = Chunk {
            index: self.index,
            offset: self.offset,
            data: buf,
        };
        self.offset += read_size as u64;
        self.index += 1;
        Ok(Some(chunk))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

// ---------------------------------------------------------------------------
// BlockCache
// ---------------------------------------------------------------------------

/// On-disk cache of encrypted blocks, laid out as `<root>/<key>/<index>`.
///
/// Keys are upload ids on the upload side and revision ids on the download
/// side. A revision without blocks is materialised as a zero-length file at
/// `<root>/<key>`.
#[derive(Debug, Clone)]
pub struct BlockCache {
    root: PathBuf,
}

impl BlockCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory (or empty-file marker) holding the blocks of `key`.
    pub fn entry_path(&self, key: &str) -> Result<PathBuf, TransferError> {
        validate_cache_key(key)?;
        Ok(self.root.join(key))
    }

    pub fn block_path(&self, key: &str, index: u32) -> Result<PathBuf, TransferError> {
        Ok(self.entry_path(key)?.join(index.to_string()))
    }

    /// Writes one block, verifying it against `expected_hash` first.
    pub fn write_block(
        &self,
        key: &str,
        index: u32,
        data: &[u8],
        expected_hash: &str,
    ) -> Result<PathBuf, TransferError> {
        verify_checksum(index, data, expected_hash)?;

        let path = self.block_path(key, index)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Reads a cached block and re-checks it against `expected_hash`.
    pub fn read_block(path: &Path, index: u32, expected_hash: &str) -> Result<Vec<u8>, TransferError> {
        let data = std::fs::read(path)?;
        verify_checksum(index, &data, expected_hash)?;
        Ok(data)
    }

    /// Creates the zero-length file standing in for an empty revision.
    pub fn write_empty(&self, key: &str) -> Result<PathBuf, TransferError> {
        let path = self.entry_path(key)?;
        std::fs::create_dir_all(&self.root)?;
        std::fs::File::create(&path)?;
        Ok(path)
    }

    /// Drops every cached block for `key`. Missing entries are not an error.
    pub fn remove(&self, key: &str) -> Result<(), TransferError> {
        let path = self.entry_path(key)?;
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
