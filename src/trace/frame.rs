//! Event frames and their fixed on-disk layout.
//!
//! Each frame starts with a `BasicInfo` record in the events stream. When
//! the encoded event carries exec info, the record is followed by an
//! architecture tag, the architecture-sized general-register block, an
//! extra-register format byte, a u32 length, and the extra-register bytes.
//!
//! # `BasicInfo` layout (36 bytes, little-endian)
//! - `global_time` (u64)
//! - `tid` (i32)
//! - `event.kind` (u32)
//! - `event.flags` (u32)
//! - `ticks` (u64)
//! - `monotonic_sec` (f64, IEEE 754 bits)
//!
//! The layout is host-endian in spirit (the format is not portable across
//! endianness) but encoded field-at-a-time so there is no padding to leak.

/// Monotonic logical clock shared by all substreams.
///
/// Recording starts at 1; reading starts at 0 and reaches 1 on the first
/// frame.
pub type FrameTime = u64;

/// Hardware tick counter value attached to each frame.
pub type Ticks = u64;

/// Compact event descriptor recorded with every frame.
///
/// The engine does not interpret `kind`; it only inspects the flags that
/// change the frame's wire layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodedEvent {
    pub kind: u32,
    pub flags: u32,
}

impl EncodedEvent {
    /// Flag: the frame carries an architecture tag and register payloads.
    pub const HAS_EXEC_INFO: u32 = 1 << 0;

    #[must_use]
    pub const fn new(kind: u32) -> Self {
        Self { kind, flags: 0 }
    }

    #[must_use]
    pub const fn with_exec_info(kind: u32) -> Self {
        Self {
            kind,
            flags: Self::HAS_EXEC_INFO,
        }
    }

    #[must_use]
    pub const fn has_exec_info(self) -> bool {
        self.flags & Self::HAS_EXEC_INFO != 0
    }
}

/// CPU architecture a register block was captured on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupportedArch {
    X86,
    X8664,
}

/// Largest general-register block across supported architectures.
pub const MAX_USER_REGS_SIZE: usize = 216;

impl SupportedArch {
    /// Byte length of the architecture's general-register block
    /// (`user_regs_struct`).
    #[must_use]
    pub const fn user_regs_size(self) -> usize {
        match self {
            SupportedArch::X86 => 68,
            SupportedArch::X8664 => 216,
        }
    }

    /// One-byte on-disk tag.
    #[must_use]
    pub const fn as_tag(self) -> u8 {
        match self {
            SupportedArch::X86 => 0,
            SupportedArch::X8664 => 1,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SupportedArch::X86),
            1 => Some(SupportedArch::X8664),
            _ => None,
        }
    }
}

/// Raw general-register block for one architecture.
///
/// Stored as a max-size array with the architecture selecting the live
/// prefix; unused tail bytes are always zero so equality is structural.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registers {
    arch: SupportedArch,
    data: [u8; MAX_USER_REGS_SIZE],
}

impl Registers {
    /// Zero-filled register block.
    #[must_use]
    pub const fn new(arch: SupportedArch) -> Self {
        Self {
            arch,
            data: [0u8; MAX_USER_REGS_SIZE],
        }
    }

    /// Builds a block from raw ptrace-layout bytes.
    ///
    /// `bytes` must be exactly the architecture's register-block length.
    #[must_use]
    pub fn from_bytes(arch: SupportedArch, bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), arch.user_regs_size(), "register block size");
        let mut data = [0u8; MAX_USER_REGS_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Self { arch, data }
    }

    #[must_use]
    pub const fn arch(&self) -> SupportedArch {
        self.arch
    }

    /// Live register bytes (architecture-sized prefix).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.arch.user_regs_size()]
    }
}

/// Format tag for the extra-register (FPU/SIMD) payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExtraRegFormat {
    #[default]
    None = 0,
    Xsave = 1,
}

impl ExtraRegFormat {
    #[must_use]
    pub const fn as_tag(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ExtraRegFormat::None),
            1 => Some(ExtraRegFormat::Xsave),
            _ => None,
        }
    }
}

/// Extra-register payload (XSAVE area or absent).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtraRegisters {
    format: ExtraRegFormat,
    data: Vec<u8>,
}

impl ExtraRegisters {
    /// Empty payload with format `None`.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            format: ExtraRegFormat::None,
            data: Vec::new(),
        }
    }

    /// Payload from raw bytes in the given format.
    #[must_use]
    pub fn from_raw(format: ExtraRegFormat, data: Vec<u8>) -> Self {
        debug_assert!(
            format != ExtraRegFormat::None || data.is_empty(),
            "format None implies empty data"
        );
        Self { format, data }
    }

    #[must_use]
    pub const fn format(&self) -> ExtraRegFormat {
        self.format
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Register state attached to frames whose event carries exec info.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecInfo {
    pub regs: Registers,
    pub extra_regs: ExtraRegisters,
}

/// One logical unit of recorded execution.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceFrame {
    time: FrameTime,
    tid: i32,
    event: EncodedEvent,
    ticks: Ticks,
    monotonic_sec: f64,
    exec_info: Option<ExecInfo>,
}

impl TraceFrame {
    /// Frame for an event without exec info.
    #[must_use]
    pub fn new(time: FrameTime, tid: i32, event: EncodedEvent, ticks: Ticks, monotonic_sec: f64) -> Self {
        assert!(!event.has_exec_info(), "event requires exec info");
        Self {
            time,
            tid,
            event,
            ticks,
            monotonic_sec,
            exec_info: None,
        }
    }

    /// Frame for an event carrying register state.
    #[must_use]
    pub fn with_exec_info(
        time: FrameTime,
        tid: i32,
        event: EncodedEvent,
        ticks: Ticks,
        monotonic_sec: f64,
        regs: Registers,
        extra_regs: ExtraRegisters,
    ) -> Self {
        assert!(event.has_exec_info(), "event does not carry exec info");
        Self {
            time,
            tid,
            event,
            ticks,
            monotonic_sec,
            exec_info: Some(ExecInfo { regs, extra_regs }),
        }
    }

    #[must_use]
    pub const fn time(&self) -> FrameTime {
        self.time
    }

    #[must_use]
    pub const fn tid(&self) -> i32 {
        self.tid
    }

    #[must_use]
    pub const fn event(&self) -> EncodedEvent {
        self.event
    }

    #[must_use]
    pub const fn ticks(&self) -> Ticks {
        self.ticks
    }

    #[must_use]
    pub const fn monotonic_sec(&self) -> f64 {
        self.monotonic_sec
    }

    #[must_use]
    pub const fn exec_info(&self) -> Option<&ExecInfo> {
        self.exec_info.as_ref()
    }
}

/// Fixed-layout prefix of every event frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BasicInfo {
    pub time: FrameTime,
    pub tid: i32,
    pub event: EncodedEvent,
    pub ticks: Ticks,
    pub monotonic_sec: f64,
}

impl BasicInfo {
    pub const SIZE: usize = 36;

    pub fn from_frame(frame: &TraceFrame) -> Self {
        Self {
            time: frame.time(),
            tid: frame.tid(),
            event: frame.event(),
            ticks: frame.ticks(),
            monotonic_sec: frame.monotonic_sec(),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..12].copy_from_slice(&self.tid.to_le_bytes());
        out[12..16].copy_from_slice(&self.event.kind.to_le_bytes());
        out[16..20].copy_from_slice(&self.event.flags.to_le_bytes());
        out[20..28].copy_from_slice(&self.ticks.to_le_bytes());
        out[28..36].copy_from_slice(&self.monotonic_sec.to_bits().to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut u64_buf = [0u8; 8];
        let mut u32_buf = [0u8; 4];

        u64_buf.copy_from_slice(&bytes[0..8]);
        let time = u64::from_le_bytes(u64_buf);
        u32_buf.copy_from_slice(&bytes[8..12]);
        let tid = i32::from_le_bytes(u32_buf);
        u32_buf.copy_from_slice(&bytes[12..16]);
        let kind = u32::from_le_bytes(u32_buf);
        u32_buf.copy_from_slice(&bytes[16..20]);
        let flags = u32::from_le_bytes(u32_buf);
        u64_buf.copy_from_slice(&bytes[20..28]);
        let ticks = u64::from_le_bytes(u64_buf);
        u64_buf.copy_from_slice(&bytes[28..36]);
        let monotonic_sec = f64::from_bits(u64::from_le_bytes(u64_buf));

        Self {
            time,
            tid,
            event: EncodedEvent { kind, flags },
            ticks,
            monotonic_sec,
        }
    }
}
