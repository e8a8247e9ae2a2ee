//! In-memory model of decoded perf events.
//!
//! The decoder that reads perf.data is a separate component; it hands the
//! pipeline a `Vec<PerfEvent>` and the pipeline mutates the buffer in place
//! (rewriting sample addresses, normalizing kernel mmaps, dropping unused
//! events). Only the fields the pipeline interprets are modeled; payloads it
//! never looks inside are collapsed into [`EventData::Other`].

// Record types from the kernel perf ABI.
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_READ: u32 = 8;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_AUX: u32 = 11;
pub const PERF_RECORD_ITRACE_START: u32 = 12;
pub const PERF_RECORD_LOST_SAMPLES: u32 = 13;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;
pub const PERF_RECORD_NAMESPACES: u32 = 16;
pub const PERF_RECORD_KSYMBOL: u32 = 17;
pub const PERF_RECORD_BPF_EVENT: u32 = 18;
pub const PERF_RECORD_CGROUP: u32 = 19;
pub const PERF_RECORD_TEXT_POKE: u32 = 20;
pub const PERF_RECORD_AUX_OUTPUT_HW_ID: u32 = 21;

// Synthetic record types generated by the perf tool itself rather than the
// kernel. Everything at or above USER_TYPE_START is tool-level metadata.
pub const PERF_RECORD_USER_TYPE_START: u32 = 64;
pub const PERF_RECORD_HEADER_ATTR: u32 = 64;
pub const PERF_RECORD_HEADER_EVENT_TYPE: u32 = 65;
pub const PERF_RECORD_HEADER_TRACING_DATA: u32 = 66;
pub const PERF_RECORD_HEADER_BUILD_ID: u32 = 67;
pub const PERF_RECORD_FINISHED_ROUND: u32 = 68;
pub const PERF_RECORD_ID_INDEX: u32 = 69;
pub const PERF_RECORD_AUXTRACE_INFO: u32 = 70;
pub const PERF_RECORD_AUXTRACE: u32 = 71;
pub const PERF_RECORD_AUXTRACE_ERROR: u32 = 72;
pub const PERF_RECORD_THREAD_MAP: u32 = 73;
pub const PERF_RECORD_CPU_MAP: u32 = 74;
pub const PERF_RECORD_STAT_CONFIG: u32 = 75;
pub const PERF_RECORD_STAT: u32 = 76;
pub const PERF_RECORD_STAT_ROUND: u32 = 77;
pub const PERF_RECORD_EVENT_UPDATE: u32 = 78;
pub const PERF_RECORD_TIME_CONV: u32 = 79;
pub const PERF_RECORD_HEADER_FEATURE: u32 = 80;

// header.misc bits.
pub const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 0b111;
pub const PERF_RECORD_MISC_CPUMODE_UNKNOWN: u16 = 0;
pub const PERF_RECORD_MISC_KERNEL: u16 = 1;
pub const PERF_RECORD_MISC_USER: u16 = 2;
pub const PERF_RECORD_MISC_HYPERVISOR: u16 = 3;
pub const PERF_RECORD_MISC_GUEST_KERNEL: u16 = 4;
pub const PERF_RECORD_MISC_GUEST_USER: u16 = 5;

// Callchain context markers. Entries at or above PERF_CONTEXT_MAX are not
// real addresses; they annotate which side of the kernel/user boundary the
// following frames belong to.
pub const PERF_CONTEXT_HV: u64 = -32i64 as u64;
pub const PERF_CONTEXT_KERNEL: u64 = -128i64 as u64;
pub const PERF_CONTEXT_USER: u64 = -512i64 as u64;
pub const PERF_CONTEXT_GUEST: u64 = -2048i64 as u64;
pub const PERF_CONTEXT_GUEST_KERNEL: u64 = -2176i64 as u64;
pub const PERF_CONTEXT_GUEST_USER: u64 = -2560i64 as u64;
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

/// The common header every perf record starts with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

/// One last-branch-record entry of a sample's branch stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchStackEntry {
    pub from_ip: u64,
    pub to_ip: u64,
    pub mispredicted: bool,
    pub predicted: bool,
    pub in_transaction: bool,
    pub abort: bool,
    pub cycles: u32,
}

impl BranchStackEntry {
    /// Trailing branch stack entries with both endpoints zero are padding.
    pub fn is_null(&self) -> bool {
        self.from_ip == 0 && self.to_ip == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleEvent {
    pub pid: u32,
    pub tid: u32,
    pub ip: u64,
    pub addr: Option<u64>,
    pub time: Option<u64>,
    pub id: Option<u64>,
    pub cpu: Option<u32>,
    pub period: Option<u64>,
    pub callchain: Vec<u64>,
    pub branch_stack: Vec<BranchStackEntry>,
    pub cgroup: Option<u64>,
    /// Index into the file's attr table, when the decoder demultiplexed the
    /// sample id. Passed through to the consumer untouched.
    pub attr_index: Option<usize>,
}

/// Shared payload of MMAP and MMAP2 records. Plain MMAP leaves the device
/// identity fields zero.
#[derive(Debug, Clone, Default)]
pub struct MmapEvent {
    pub pid: u32,
    pub tid: u32,
    pub start: u64,
    pub len: u64,
    pub pgoff: u64,
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
    pub ino_generation: u64,
    pub filename: String,
    /// MD5 prefix of the filename when the path itself was stripped from the
    /// data for privacy.
    pub filename_md5_prefix: Option<u64>,
    /// MMAP2 records carry the build id in place of the device identity when
    /// the kernel was asked for it.
    pub build_id: Option<Vec<u8>>,
    pub time: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct CommEvent {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub time: Option<u64>,
}

/// FORK and EXIT share this layout in the perf ABI.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkEvent {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct CgroupEvent {
    pub id: u64,
    pub path: String,
}

#[derive(Debug, Clone)]
pub enum EventData {
    Sample(SampleEvent),
    Mmap(MmapEvent),
    Comm(CommEvent),
    Fork(ForkEvent),
    Exit(ForkEvent),
    Cgroup(CgroupEvent),
    /// Records the pipeline counts but never looks inside.
    Other,
}

#[derive(Debug, Clone)]
pub struct PerfEvent {
    pub header: EventHeader,
    pub data: EventData,
}

impl PerfEvent {
    pub fn sample(&self) -> Option<&SampleEvent> {
        match &self.data {
            EventData::Sample(s) => Some(s),
            _ => None,
        }
    }

    pub fn sample_mut(&mut self) -> Option<&mut SampleEvent> {
        match &mut self.data {
            EventData::Sample(s) => Some(s),
            _ => None,
        }
    }

    pub fn mmap(&self) -> Option<&MmapEvent> {
        match &self.data {
            EventData::Mmap(m) => Some(m),
            _ => None,
        }
    }

    pub fn mmap_mut(&mut self) -> Option<&mut MmapEvent> {
        match &mut self.data {
            EventData::Mmap(m) => Some(m),
            _ => None,
        }
    }

    pub fn comm(&self) -> Option<&CommEvent> {
        match &self.data {
            EventData::Comm(c) => Some(c),
            _ => None,
        }
    }

    pub fn fork(&self) -> Option<&ForkEvent> {
        match &self.data {
            EventData::Fork(f) | EventData::Exit(f) => Some(f),
            _ => None,
        }
    }

    /// Timestamp used by the optional time sort. Not every record carries
    /// one; records without a timestamp keep their relative order.
    pub fn timestamp(&self) -> Option<u64> {
        match &self.data {
            EventData::Sample(s) => s.time,
            EventData::Mmap(m) => m.time,
            EventData::Comm(c) => c.time,
            EventData::Fork(f) | EventData::Exit(f) => f.time,
            EventData::Cgroup(_) | EventData::Other => None,
        }
    }
}

/// Human-readable record type name for log messages.
pub fn event_name(kind: u32) -> &'static str {
    match kind {
        PERF_RECORD_MMAP => "MMAP",
        PERF_RECORD_LOST => "LOST",
        PERF_RECORD_COMM => "COMM",
        PERF_RECORD_EXIT => "EXIT",
        PERF_RECORD_THROTTLE => "THROTTLE",
        PERF_RECORD_UNTHROTTLE => "UNTHROTTLE",
        PERF_RECORD_FORK => "FORK",
        PERF_RECORD_READ => "READ",
        PERF_RECORD_SAMPLE => "SAMPLE",
        PERF_RECORD_MMAP2 => "MMAP2",
        PERF_RECORD_AUX => "AUX",
        PERF_RECORD_ITRACE_START => "ITRACE_START",
        PERF_RECORD_LOST_SAMPLES => "LOST_SAMPLES",
        PERF_RECORD_SWITCH => "SWITCH",
        PERF_RECORD_SWITCH_CPU_WIDE => "SWITCH_CPU_WIDE",
        PERF_RECORD_NAMESPACES => "NAMESPACES",
        PERF_RECORD_KSYMBOL => "KSYMBOL",
        PERF_RECORD_BPF_EVENT => "BPF_EVENT",
        PERF_RECORD_CGROUP => "CGROUP",
        PERF_RECORD_TEXT_POKE => "TEXT_POKE",
        PERF_RECORD_AUX_OUTPUT_HW_ID => "AUX_OUTPUT_HW_ID",
        PERF_RECORD_HEADER_ATTR => "HEADER_ATTR",
        PERF_RECORD_HEADER_EVENT_TYPE => "HEADER_EVENT_TYPE",
        PERF_RECORD_HEADER_TRACING_DATA => "HEADER_TRACING_DATA",
        PERF_RECORD_HEADER_BUILD_ID => "HEADER_BUILD_ID",
        PERF_RECORD_FINISHED_ROUND => "FINISHED_ROUND",
        PERF_RECORD_ID_INDEX => "ID_INDEX",
        PERF_RECORD_AUXTRACE_INFO => "AUXTRACE_INFO",
        PERF_RECORD_AUXTRACE => "AUXTRACE",
        PERF_RECORD_AUXTRACE_ERROR => "AUXTRACE_ERROR",
        PERF_RECORD_THREAD_MAP => "THREAD_MAP",
        PERF_RECORD_CPU_MAP => "CPU_MAP",
        PERF_RECORD_STAT_CONFIG => "STAT_CONFIG",
        PERF_RECORD_STAT => "STAT",
        PERF_RECORD_STAT_ROUND => "STAT_ROUND",
        PERF_RECORD_EVENT_UPDATE => "EVENT_UPDATE",
        PERF_RECORD_TIME_CONV => "TIME_CONV",
        PERF_RECORD_HEADER_FEATURE => "HEADER_FEATURE",
        _ => "UNKNOWN",
    }
}
