//! Substream registry: the six parallel streams of a trace.
//!
//! The enum order is fixed and the names are part of the on-disk contract
//! (each substream is a file of that name in the trace directory).
//! Compression parameters are per-stream: the raw-data stream dominates
//! trace volume by far, so it alone gets a multi-threaded compressor.

use std::sync::OnceLock;

/// One of the six parallel trace streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Substream {
    /// Event frames: fixed-layout records plus optional register payloads.
    Events = 0,
    /// Raw-data descriptors `(time, tid, addr, len)`.
    RawDataHeader = 1,
    /// Raw captured bytes, concatenated.
    RawData = 2,
    /// Packed mapping messages.
    Mmaps = 3,
    /// Packed task lifecycle messages.
    Tasks = 4,
    /// Generic `(time, len, bytes)` records.
    Generic = 5,
}

impl Substream {
    pub const COUNT: usize = 6;

    /// All substreams in on-disk order.
    pub const ALL: [Substream; Self::COUNT] = [
        Substream::Events,
        Substream::RawDataHeader,
        Substream::RawData,
        Substream::Mmaps,
        Substream::Tasks,
        Substream::Generic,
    ];

    /// On-disk file name inside the trace directory.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Substream::Events => "events",
            Substream::RawDataHeader => "data_header",
            Substream::RawData => "data",
            Substream::Mmaps => "mmaps",
            Substream::Tasks => "tasks",
            Substream::Generic => "generic",
        }
    }

    /// Uncompressed block size for the stream's compressor.
    #[must_use]
    pub const fn block_size(self) -> usize {
        match self {
            Substream::Events | Substream::RawDataHeader | Substream::RawData => 1024 * 1024,
            Substream::Mmaps | Substream::Tasks | Substream::Generic => 64 * 1024,
        }
    }

    /// Compression worker count for the stream.
    ///
    /// `RawData` is the volume stream; its count is `min(8, cpu_count)`,
    /// computed on first query.
    #[must_use]
    pub fn threads(self) -> usize {
        match self {
            Substream::RawData => raw_data_threads(),
            _ => 1,
        }
    }

    /// Index of this substream in [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

fn raw_data_threads() -> usize {
    static THREADS: OnceLock<usize> = OnceLock::new();
    *THREADS.get_or_init(|| {
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        cpus.min(8)
    })
}
