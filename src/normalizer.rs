//! Consumer-facing callbacks with fully materialized mappings.
//!
//! [`process`] runs the parser over an event buffer, then walks the parsed
//! events in order and calls back into a [`PerfDataHandler`]: one `mmap` per
//! surviving MMAP event, one `comm` per COMM event, one `sample` per sample,
//! with every address already attached to the [`Mapping`] it resolved into.
//!
//! Mappings are handed out as `Rc<Mapping>` and are never rebuilt: the
//! mapping a sample refers to is pointer-identical to the one its MMap
//! callback delivered earlier, so consumers may use `Rc::ptr_eq` (or the
//! pointer value) as a cache key for the lifetime of the run.

use std::collections::HashMap;
use std::rc::Rc;

use crate::dso::DsoRegistry;
use crate::error::ParseError;
use crate::event::{
    CommEvent, EventData, EventHeader, MmapEvent, PerfEvent, SampleEvent, PERF_RECORD_MMAP2,
};
use crate::parser::{PerfParser, PerfParserOptions, ResolvedAddr};
use crate::process_table::KERNEL_PID;

/// Device identity of a file-backed mapping, known only from MMAP2 events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
    pub ino_generation: u64,
}

/// An immutable, identity-stable description of one mapped region as
/// delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Empty if missing.
    pub filename: String,
    /// Lowercase hex, empty if missing.
    pub build_id: String,
    pub start: u64,
    /// Exclusive ceiling.
    pub limit: u64,
    pub file_offset: u64,
    /// MD5 prefix of the filename when the path was stripped for privacy.
    pub filename_md5_prefix: Option<u64>,
    pub device: Option<DeviceId>,
}

impl Mapping {
    /// The real file path when present, otherwise the hex MD5 prefix.
    pub fn display_filename(&self) -> String {
        name_or_md5_prefix(&self.filename, self.filename_md5_prefix)
    }
}

/// Returns `name` if non-empty, otherwise the hex string of the MD5 prefix.
pub fn name_or_md5_prefix(name: &str, md5_prefix: Option<u64>) -> String {
    if !name.is_empty() {
        return name.to_string();
    }
    match md5_prefix {
        Some(prefix) => format!("{prefix:#x}"),
        None => String::new(),
    }
}

/// A resolved instruction pointer and the mapping containing it, if any.
#[derive(Debug, Clone)]
pub struct Location {
    pub ip: u64,
    pub mapping: Option<Rc<Mapping>>,
}

/// One resolved branch-stack entry.
#[derive(Debug, Clone)]
pub struct BranchStackPair {
    pub from: Location,
    pub to: Location,
    /// Branch target was mispredicted.
    pub mispredicted: bool,
    /// Branch target was predicted.
    pub predicted: bool,
    /// Running in a hardware transaction.
    pub in_transaction: bool,
    /// Aborting a hardware transaction.
    pub abort: bool,
    /// Cycles since the last taken branch.
    pub cycles: u32,
}

/// Everything the consumer gets for one sample.
pub struct SampleContext<'a> {
    pub header: &'a EventHeader,
    pub sample: &'a SampleEvent,
    /// The mapping of the main binary of the sampled process.
    pub main_mapping: Option<Rc<Mapping>>,
    /// The mapping containing `sample.ip`.
    pub sample_mapping: Option<Rc<Mapping>>,
    /// The mapping containing `sample.addr`.
    pub addr_mapping: Option<Rc<Mapping>>,
    /// Locations of the callchain entries that resolved, in order.
    pub callchain: Vec<Location>,
    /// Resolved branch stack, trimmed of null padding.
    pub branch_stack: Vec<BranchStackPair>,
    /// Index into the file's attr table, when known.
    pub file_attrs_index: Option<usize>,
    /// Cgroup path of the sampled process, when known.
    pub cgroup: Option<&'a str>,
}

pub struct CommContext<'a> {
    pub comm: &'a CommEvent,
    /// True when the comm event was caused by exec().
    pub is_exec: bool,
}

pub struct MmapContext {
    pub mapping: Rc<Mapping>,
    /// Pid of the process that owns the mapping.
    pub pid: u32,
}

/// Implement this and call [`process`]; the callbacks arrive in event order,
/// and any mapping passed to `sample` has had its `mmap` callback delivered
/// first.
pub trait PerfDataHandler {
    fn sample(&mut self, sample: SampleContext<'_>);
    fn comm(&mut self, comm: CommContext<'_>);
    fn mmap(&mut self, mmap: MmapContext);
}

/// Parses `events` and drives `handler` over the result. Returns the parser
/// so callers can inspect statistics and the rewritten buffer.
pub fn process<H: PerfDataHandler>(
    events: Vec<PerfEvent>,
    options: PerfParserOptions,
    handler: &mut H,
) -> Result<PerfParser, ParseError> {
    let mut parser = PerfParser::new(events, options);
    parser.parse()?;
    deliver(&parser, handler);
    Ok(parser)
}

/// A filename that can plausibly be a process's main binary: a real file,
/// not an anonymous region, a device, or kernel pseudo-file.
fn is_main_mapping_candidate(filename: &str) -> bool {
    filename.starts_with('/')
        && !filename.starts_with("//")
        && !filename.starts_with("/dev/")
        && !filename.starts_with("/memfd:")
        && !filename.starts_with("/anon_hugepage")
}

fn mapping_from_event(m: &MmapEvent, registry: &DsoRegistry, has_device_info: bool) -> Mapping {
    Mapping {
        filename: m.filename.clone(),
        build_id: registry
            .build_id_for(&m.filename)
            .unwrap_or_default()
            .to_string(),
        start: m.start,
        limit: m.start.saturating_add(m.len),
        file_offset: m.pgoff,
        filename_md5_prefix: m.filename_md5_prefix,
        device: has_device_info.then_some(DeviceId {
            maj: m.maj,
            min: m.min,
            ino: m.ino,
            ino_generation: m.ino_generation,
        }),
    }
}

fn deliver<H: PerfDataHandler>(parser: &PerfParser, handler: &mut H) {
    // Parsed index of an MMAP -> the mapping it produced.
    let mut mappings: HashMap<usize, Rc<Mapping>> = HashMap::new();
    let mut main_mappings: HashMap<u32, Rc<Mapping>> = HashMap::new();
    let mut cgroups: HashMap<u64, &str> = HashMap::new();

    let locate = |mappings: &HashMap<usize, Rc<Mapping>>, resolved: &ResolvedAddr| Location {
        ip: resolved.ip,
        mapping: mappings.get(&resolved.mmap_index).cloned(),
    };

    for (parsed_index, parsed) in parser.parsed_events().iter().enumerate() {
        let event = &parser.events()[parsed.event_index];
        match &event.data {
            EventData::Mmap(m) => {
                let mapping = Rc::new(mapping_from_event(
                    m,
                    parser.dso_registry(),
                    event.header.kind == PERF_RECORD_MMAP2,
                ));
                mappings.insert(parsed_index, mapping.clone());
                if m.pid != KERNEL_PID && is_main_mapping_candidate(&m.filename) {
                    main_mappings.entry(m.pid).or_insert_with(|| mapping.clone());
                }
                handler.mmap(MmapContext {
                    mapping,
                    pid: m.pid,
                });
            }
            EventData::Comm(c) => {
                handler.comm(CommContext {
                    comm: c,
                    is_exec: c.pid == c.tid,
                });
            }
            EventData::Cgroup(cg) => {
                cgroups.insert(cg.id, cg.path.as_str());
            }
            EventData::Sample(s) => {
                let sample_mapping = parsed
                    .dso_and_offset
                    .as_ref()
                    .and_then(|resolved| mappings.get(&resolved.mmap_index))
                    .cloned();
                let addr_mapping = parsed
                    .data_dso_and_offset
                    .as_ref()
                    .and_then(|resolved| mappings.get(&resolved.mmap_index))
                    .cloned();
                let callchain = parsed
                    .callchain
                    .iter()
                    .map(|resolved| locate(&mappings, resolved))
                    .collect();
                let branch_stack = parsed
                    .branch_stack
                    .iter()
                    .map(|branch| BranchStackPair {
                        from: locate(&mappings, &branch.from),
                        to: locate(&mappings, &branch.to),
                        mispredicted: branch.mispredicted,
                        predicted: branch.predicted,
                        in_transaction: branch.in_transaction,
                        abort: branch.abort,
                        cycles: branch.cycles,
                    })
                    .collect();
                handler.sample(SampleContext {
                    header: &event.header,
                    sample: s,
                    main_mapping: main_mappings.get(&s.pid).cloned(),
                    sample_mapping,
                    addr_mapping,
                    callchain,
                    branch_stack,
                    file_attrs_index: s.attr_index,
                    cgroup: s.cgroup.and_then(|id| cgroups.get(&id).copied()),
                });
            }
            EventData::Fork(_) | EventData::Exit(_) | EventData::Other => {}
        }
    }
}
