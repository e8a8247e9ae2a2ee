use thiserror::Error;

/// Fatal errors raised while parsing an event stream.
///
/// Everything here aborts the pass. Failures that are survivable (an address
/// that resolves to no mapping, a DSO whose build ID cannot be read) are not
/// errors; they are recorded in the parse statistics or simply leave the
/// affected field empty.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown event type {kind}")]
    UnknownEventType { kind: u32 },

    #[error("unable to map MMAP event {index} ({filename})")]
    MmapInsertFailed { index: usize, filename: String },

    #[error("remapped address {mapped:#x} does not preserve the page offset of {original:#x}")]
    AlignmentViolation { mapped: u64, original: u64 },

    #[error("non-null branch stack entry {from_ip:#x} -> {to_ip:#x} found after null entry")]
    MalformedBranchStack { from_ip: u64, to_ip: u64 },

    #[error("only {mapped_percent:.0}% of samples had all locations mapped, expected at least {threshold:.0}%")]
    InsufficientMappedSamples { mapped_percent: f64, threshold: f64 },

    #[error("input has no sample events")]
    NoSampleEvents,
}
