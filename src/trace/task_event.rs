//! Task lifecycle records: clone, exec, exit.
//!
//! End-of-stream is `Option::None` at the reader; there is no
//! "uninitialized" variant, so writing one is unrepresentable.

use super::frame::FrameTime;

/// The three task lifecycle transitions a trace records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEventKind {
    /// A task was created by a clone-family syscall.
    Clone {
        /// Tid of the cloning task.
        parent_tid: i32,
        /// New task's tid inside its own pid namespace.
        own_ns_tid: i32,
        /// Raw clone(2) flags.
        flags: u64,
    },
    /// A task replaced its image.
    Exec {
        file_name: String,
        cmd_line: Vec<String>,
    },
    /// A task exited.
    Exit { exit_status: i32 },
}

/// One record of the tasks substream, stamped with its owning frame time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceTaskEvent {
    time: FrameTime,
    tid: i32,
    kind: TaskEventKind,
}

impl TraceTaskEvent {
    pub(crate) fn new(time: FrameTime, tid: i32, kind: TaskEventKind) -> Self {
        Self { time, tid, kind }
    }

    /// Frame the event belongs to.
    #[must_use]
    pub const fn time(&self) -> FrameTime {
        self.time
    }

    /// Tid of the task the event describes.
    #[must_use]
    pub const fn tid(&self) -> i32 {
        self.tid
    }

    #[must_use]
    pub const fn kind(&self) -> &TaskEventKind {
        &self.kind
    }
}
