//! Block-decompressing substream reader.
//!
//! The reader never moves the underlying file cursor: blocks are fetched
//! with positioned reads (`read_at`), so cloning a reader is just a
//! descriptor dup plus a copy of the in-memory cursor. At most one
//! decompressed block is resident at a time.
//!
//! # Checkpoints
//! `save_state` / `restore_state` / `discard_state` implement the
//! speculative-read contract used by peeking and conditional reads. A
//! checkpoint holds the next-block offset plus the current block and its
//! cursor, so its memory is bounded by the writer's block size. Only one
//! checkpoint may be live at a time.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;

use flate2::read::DeflateDecoder;

use super::BlockHeader;

/// Saved read cursor for speculative reads.
#[derive(Debug)]
struct SavedState {
    next_block_offset: u64,
    block: Vec<u8>,
    pos: usize,
}

/// Compressed substream reader with checkpoint and clone support.
#[derive(Debug)]
pub struct CompressedReader {
    file: File,
    file_len: u64,
    /// File offset of the next unread block header.
    next_block_offset: u64,
    /// Current decompressed block.
    block: Vec<u8>,
    /// Read position within `block`.
    pos: usize,
    saved: Option<SavedState>,
}

impl CompressedReader {
    /// Opens a substream file for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            file,
            file_len,
            next_block_offset: 0,
            block: Vec::new(),
            pos: 0,
            saved: None,
        })
    }

    /// True iff every byte of every block has been consumed.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.pos == self.block.len() && self.next_block_offset >= self.file_len
    }

    /// Saves the read cursor. Panics if a checkpoint is already live.
    pub fn save_state(&mut self) {
        assert!(self.saved.is_none(), "nested checkpoint");
        self.saved = Some(SavedState {
            next_block_offset: self.next_block_offset,
            block: self.block.clone(),
            pos: self.pos,
        });
    }

    /// Rewinds the cursor to the live checkpoint and drops it.
    pub fn restore_state(&mut self) {
        let saved = self.saved.take().expect("no checkpoint to restore");
        self.next_block_offset = saved.next_block_offset;
        self.block = saved.block;
        self.pos = saved.pos;
    }

    /// Drops the live checkpoint, keeping the current cursor.
    pub fn discard_state(&mut self) {
        let discarded = self.saved.take();
        debug_assert!(discarded.is_some(), "no checkpoint to discard");
    }

    /// Resets the cursor to the start of the stream and drops any
    /// checkpoint.
    pub fn rewind(&mut self) {
        self.next_block_offset = 0;
        self.block.clear();
        self.pos = 0;
        self.saved = None;
    }

    /// Returns an independent reader at the same logical position.
    ///
    /// The clone does not inherit a live checkpoint.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            file_len: self.file_len,
            next_block_offset: self.next_block_offset,
            block: self.block.clone(),
            pos: self.pos,
            saved: None,
        })
    }

    /// Total on-disk byte length of the stream.
    #[must_use]
    pub fn compressed_bytes(&self) -> u64 {
        self.file_len
    }

    /// Total decompressed byte length of the stream, from a scan of the
    /// block headers. Independent of the read cursor.
    pub fn uncompressed_bytes(&self) -> io::Result<u64> {
        let mut total = 0u64;
        let mut offset = 0u64;
        while offset < self.file_len {
            let header = self.read_header_at(offset)?;
            total += u64::from(header.uncompressed_len);
            offset += BlockHeader::SIZE as u64 + u64::from(header.compressed_len);
        }
        Ok(total)
    }

    fn read_header_at(&self, offset: u64) -> io::Result<BlockHeader> {
        let mut bytes = [0u8; BlockHeader::SIZE];
        self.file.read_exact_at(&mut bytes, offset)?;
        BlockHeader::decode(&bytes)
    }

    /// Fetches and inflates the next block.
    fn refill(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.pos, self.block.len());
        let header = self.read_header_at(self.next_block_offset)?;
        let mut compressed = vec![0u8; header.compressed_len as usize];
        self.file
            .read_exact_at(&mut compressed, self.next_block_offset + BlockHeader::SIZE as u64)?;

        self.block.clear();
        self.block.reserve(header.uncompressed_len as usize);
        let mut decoder = DeflateDecoder::new(compressed.as_slice());
        decoder.read_to_end(&mut self.block)?;
        if self.block.len() != header.uncompressed_len as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "block inflated to unexpected length",
            ));
        }
        self.pos = 0;
        self.next_block_offset += BlockHeader::SIZE as u64 + u64::from(header.compressed_len);
        Ok(())
    }
}

impl Read for CompressedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos == self.block.len() {
            if self.next_block_offset >= self.file_len {
                return Ok(0);
            }
            self.refill()?;
        }
        let n = buf.len().min(self.block.len() - self.pos);
        buf[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
