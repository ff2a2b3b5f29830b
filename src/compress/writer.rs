//! Block-compressing substream writer.
//!
//! Bytes are buffered until a full block accumulates, then handed to a
//! small worker pool for DEFLATE compression. A dedicated output thread
//! reorders finished blocks by sequence number so the file always contains
//! blocks in submission order regardless of worker scheduling.
//!
//! Errors are sticky: once any thread fails, `good()` reports false and
//! every later call returns the failure. `close()` is the synchronization
//! point that flushes the final partial block, joins all threads, and
//! syncs the file.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as chan;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use super::BlockHeader;

/// One uncompressed block on its way to a worker.
struct Job {
    seq: u64,
    data: Vec<u8>,
}

/// One compressed block on its way to the output thread.
struct Finished {
    seq: u64,
    uncompressed_len: u32,
    data: Vec<u8>,
}

impl PartialEq for Finished {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Finished {}

impl PartialOrd for Finished {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Finished {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

/// Compressed substream writer.
///
/// Writes are append-only and strictly ordered; `flush` is a no-op because
/// a partial block cannot be emitted mid-stream. Dropping the writer
/// without `close()` finalizes it best-effort.
pub struct CompressedWriter {
    block_size: usize,
    pending: Vec<u8>,
    next_seq: u64,
    job_tx: Option<chan::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    output: Option<JoinHandle<io::Result<()>>>,
    failed: Arc<AtomicBool>,
}

impl CompressedWriter {
    /// Creates the substream file and spawns `threads` compressor workers
    /// plus the output thread.
    pub fn create(path: &Path, block_size: usize, threads: usize) -> io::Result<Self> {
        assert!(block_size > 0, "block_size must be positive");
        let file = File::create(path)?;
        let failed = Arc::new(AtomicBool::new(false));

        let (job_tx, job_rx) = chan::unbounded::<Job>();
        let (done_tx, done_rx) = chan::unbounded::<Finished>();

        let mut workers = Vec::with_capacity(threads.max(1));
        for _ in 0..threads.max(1) {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let failed = Arc::clone(&failed);
            workers.push(std::thread::spawn(move || {
                compress_worker(&job_rx, &done_tx, &failed);
            }));
        }
        drop(job_rx);
        drop(done_tx);

        let output_failed = Arc::clone(&failed);
        let output = std::thread::spawn(move || write_blocks(file, &done_rx, &output_failed));

        Ok(Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            next_seq: 0,
            job_tx: Some(job_tx),
            workers,
            output: Some(output),
            failed,
        })
    }

    /// True iff no thread has recorded a failure.
    #[must_use]
    pub fn good(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    /// Appends bytes, submitting full blocks to the worker pool.
    pub fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.good() {
            return Err(io::Error::other("compressed writer already failed"));
        }
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            let block = std::mem::replace(&mut self.pending, rest);
            self.submit(block)?;
        }
        Ok(())
    }

    /// Flushes the final partial block, joins all threads, and syncs the
    /// file. Idempotent; later calls return `Ok(())`.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(job_tx) = self.job_tx.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            let seq = self.next_seq;
            self.next_seq += 1;
            if job_tx.send(Job { seq, data: block }).is_err() {
                self.failed.store(true, Ordering::Release);
                result = Err(io::Error::other("compression pipeline shut down early"));
            }
        }
        drop(job_tx);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(output) = self.output.take() {
            match output.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.failed.store(true, Ordering::Release);
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(_) => {
                    self.failed.store(true, Ordering::Release);
                    if result.is_ok() {
                        result = Err(io::Error::other("compression output thread panicked"));
                    }
                }
            }
        }
        if result.is_ok() && !self.good() {
            result = Err(io::Error::other("compression worker failed"));
        }
        result
    }

    fn submit(&mut self, data: Vec<u8>) -> io::Result<()> {
        debug_assert!(!data.is_empty());
        let seq = self.next_seq;
        self.next_seq += 1;
        let tx = self
            .job_tx
            .as_ref()
            .expect("write_bytes called after close");
        if tx.send(Job { seq, data }).is_err() {
            self.failed.store(true, Ordering::Release);
            return Err(io::Error::other("compression pipeline shut down early"));
        }
        Ok(())
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CompressedWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn compress_worker(
    job_rx: &chan::Receiver<Job>,
    done_tx: &chan::Sender<Finished>,
    failed: &AtomicBool,
) {
    while let Ok(job) = job_rx.recv() {
        let uncompressed_len = job.data.len() as u32;
        let capacity = job.data.len() / 2 + 64;
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(capacity), Compression::default());
        let data = match encoder.write_all(&job.data).and_then(|()| encoder.finish()) {
            Ok(data) => data,
            Err(_) => {
                failed.store(true, Ordering::Release);
                return;
            }
        };
        if done_tx
            .send(Finished {
                seq: job.seq,
                uncompressed_len,
                data,
            })
            .is_err()
        {
            return;
        }
    }
}

fn write_blocks(
    mut file: File,
    done_rx: &chan::Receiver<Finished>,
    failed: &AtomicBool,
) -> io::Result<()> {
    let mut next_seq = 0u64;
    let mut reorder: BinaryHeap<Reverse<Finished>> = BinaryHeap::new();
    while let Ok(block) = done_rx.recv() {
        reorder.push(Reverse(block));
        while reorder.peek().is_some_and(|b| b.0.seq == next_seq) {
            let Reverse(block) = reorder.pop().expect("peeked entry present");
            let header = BlockHeader {
                compressed_len: block.data.len() as u32,
                uncompressed_len: block.uncompressed_len,
            };
            let write = file
                .write_all(&header.encode())
                .and_then(|()| file.write_all(&block.data));
            if let Err(err) = write {
                failed.store(true, Ordering::Release);
                return Err(err);
            }
            next_seq += 1;
        }
    }
    if !reorder.is_empty() {
        // A worker died without delivering its block.
        failed.store(true, Ordering::Release);
        return Err(io::Error::other("compression block sequence incomplete"));
    }
    if failed.load(Ordering::Acquire) {
        return Err(io::Error::other("compression worker failed"));
    }
    file.sync_all()
}
