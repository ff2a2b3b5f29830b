//! State shared by the trace writer and reader: the directory and the
//! logical clock.

use std::path::{Path, PathBuf};

use super::frame::FrameTime;
use super::substream::Substream;

/// Common core of a trace stream endpoint.
#[derive(Clone, Debug)]
pub(crate) struct TraceStream {
    trace_dir: PathBuf,
    global_time: FrameTime,
}

impl TraceStream {
    pub fn new(trace_dir: PathBuf, initial_time: FrameTime) -> Self {
        Self {
            trace_dir,
            global_time: initial_time,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.trace_dir
    }

    pub fn time(&self) -> FrameTime {
        self.global_time
    }

    pub fn set_time(&mut self, time: FrameTime) {
        self.global_time = time;
    }

    /// Advances the logical clock by one frame.
    pub fn tick_time(&mut self) {
        self.global_time += 1;
    }

    /// On-disk path of a substream.
    pub fn substream_path(&self, substream: Substream) -> PathBuf {
        self.trace_dir.join(substream.name())
    }

    /// Name reserved for per-task cloned file data.
    ///
    /// The core never writes these files; the naming format is a contract
    /// with higher layers.
    pub fn file_data_clone_file_name(&self, tid: i32, serial: u32) -> PathBuf {
        self.trace_dir.join(format!("cloned_data_{tid}_{serial}"))
    }
}
