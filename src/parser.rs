//! The event pipeline: one pass over a decoded perf event stream that
//! resolves every sampled address against the right process's memory map.
//!
//! The parser owns the event buffer. Each [`ParsedEvent`] carries an index
//! into it rather than a reference, and mapper regions are tagged with the
//! index of their originating MMAP in the parsed sequence; that index is the
//! only link from a resolved address back to its mapping. Buffer reordering
//! (the discard pass) therefore happens strictly after the main pass and
//! rewrites the indices it invalidates.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{error, info, trace};

use crate::address_mapper::host_page_size;
use crate::command_table::{CommandTable, PidTid};
use crate::dso::{find_dso_build_id, DsoRegistry};
use crate::error::ParseError;
use crate::event::{event_name, PerfEvent};
use crate::event::{
    PERF_CONTEXT_MAX, PERF_RECORD_AUX, PERF_RECORD_CGROUP, PERF_RECORD_COMM, PERF_RECORD_EXIT,
    PERF_RECORD_FINISHED_ROUND, PERF_RECORD_FORK, PERF_RECORD_ITRACE_START, PERF_RECORD_LOST,
    PERF_RECORD_LOST_SAMPLES, PERF_RECORD_MISC_CPUMODE_MASK, PERF_RECORD_MISC_KERNEL,
    PERF_RECORD_MMAP, PERF_RECORD_MMAP2, PERF_RECORD_NAMESPACES, PERF_RECORD_SAMPLE,
    PERF_RECORD_SWITCH, PERF_RECORD_SWITCH_CPU_WIDE, PERF_RECORD_THROTTLE,
    PERF_RECORD_UNTHROTTLE, PERF_RECORD_USER_TYPE_START,
};
use crate::huge_page;
use crate::process_table::ProcessTable;
use crate::utils::pack_pid_tid;

/// Set on a callchain entry that resolved to no mapping. With remapping the
/// marked value sits above the synthetic high-water mark; without it, above
/// every platform's user-space range. Either way downstream consumers can
/// tell unresolved entries apart without a side channel.
pub const UNMAPPED_ADDRESS_BIT: u64 = 1 << 63;

/// Knobs for a parse pass. The defaults match a plain normalization run:
/// addresses kept real, events time-sorted, and a 95% mapping floor.
#[derive(Debug, Clone)]
pub struct PerfParserOptions {
    /// Rewrite addresses through the compact synthetic space.
    pub do_remap: bool,
    /// Drop MMAP events that no sample resolved into, after processing.
    pub discard_unused_events: bool,
    /// Stable-sort events by timestamp before parsing.
    pub sort_events_by_time: bool,
    /// Fold transparent-huge-page mappings into their file-backed
    /// neighbours before parsing.
    pub deduce_huge_page_mappings: bool,
    /// Coalesce contiguous split mappings of the same file before parsing.
    pub combine_mappings: bool,
    /// Read build ids of hit DSOs from the filesystem after the main pass.
    pub read_missing_buildids: bool,
    /// Recognize perf-jitdump mappings (filename containing "jitted-") and
    /// exempt them from page-alignment rules.
    pub allow_unaligned_jit_mappings: bool,
    /// Fail the pass when fewer than this percentage of samples had every
    /// location mapped.
    pub sample_mapping_percentage_threshold: f64,
    /// The decoder deliberately dropped SAMPLE records, so an input without
    /// samples is not an error.
    pub sample_events_excluded: bool,
    /// Page size for synthetic address assignment; `None` uses the host
    /// page size. Injected so tests can pick a deterministic value.
    pub page_alignment: Option<u64>,
}

impl Default for PerfParserOptions {
    fn default() -> Self {
        PerfParserOptions {
            do_remap: false,
            discard_unused_events: false,
            sort_events_by_time: true,
            deduce_huge_page_mappings: false,
            combine_mappings: false,
            read_missing_buildids: false,
            allow_unaligned_jit_mappings: false,
            sample_mapping_percentage_threshold: 95.0,
            sample_events_excluded: false,
            page_alignment: None,
        }
    }
}

/// Counters collected over one parse pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfParserStats {
    pub num_mmap_events: u64,
    pub num_comm_events: u64,
    pub num_fork_events: u64,
    pub num_exit_events: u64,
    pub num_sample_events: u64,
    /// Samples whose IP, callchain and branch stack all resolved.
    pub num_sample_events_mapped: u64,
    pub num_data_sample_events: u64,
    pub num_data_sample_events_mapped: u64,
    pub did_remap: bool,
}

/// A sampled address resolved against a process's memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddr {
    /// Index into the parser's [`DsoRegistry`].
    pub dso: usize,
    /// Index of the owning MMAP in the parsed event sequence.
    pub mmap_index: usize,
    /// The outgoing address: remapped when `do_remap` is set, the original
    /// address otherwise.
    pub ip: u64,
    /// File offset of the address within the DSO.
    pub offset: u64,
}

/// One resolved branch-stack entry. Flags and cycle count pass through from
/// the hardware record unchanged.
#[derive(Debug, Clone, Copy)]
pub struct ParsedBranch {
    pub from: ResolvedAddr,
    pub to: ResolvedAddr,
    pub mispredicted: bool,
    pub predicted: bool,
    pub in_transaction: bool,
    pub abort: bool,
    pub cycles: u32,
}

/// Per-event results of the pass, parallel to the (filtered) event buffer.
#[derive(Debug, Clone, Default)]
pub struct ParsedEvent {
    /// Index of the underlying event in the parser's buffer.
    pub event_index: usize,
    /// Command of the sampled thread, when known.
    pub command: Option<Rc<str>>,
    /// Resolution of the sample's IP.
    pub dso_and_offset: Option<ResolvedAddr>,
    /// Resolution of the sample's data address.
    pub data_dso_and_offset: Option<ResolvedAddr>,
    /// Resolutions of the callchain entries that mapped, in order.
    pub callchain: Vec<ResolvedAddr>,
    /// Resolved branch stack, trimmed of null padding.
    pub branch_stack: Vec<ParsedBranch>,
    /// For MMAP events: how many sampled addresses resolved into this
    /// region.
    pub num_samples_in_mmap_region: u64,
}

/// Stateful pipeline over a decoded perf event buffer.
pub struct PerfParser {
    options: PerfParserOptions,
    page_alignment: u64,
    events: Vec<PerfEvent>,
    parsed_events: Vec<ParsedEvent>,
    process_table: ProcessTable,
    command_table: CommandTable,
    dso_registry: DsoRegistry,
    /// Filename -> hex build id. Seeded by the decoder from the file's
    /// build-id section; updated when the filesystem search finds one.
    build_id_index: HashMap<String, String>,
    stats: PerfParserStats,
}

impl PerfParser {
    pub fn new(events: Vec<PerfEvent>, options: PerfParserOptions) -> Self {
        let page_alignment = options.page_alignment.unwrap_or_else(host_page_size);
        PerfParser {
            options,
            page_alignment,
            events,
            parsed_events: Vec::new(),
            process_table: ProcessTable::new(page_alignment),
            command_table: CommandTable::new(),
            dso_registry: DsoRegistry::new(),
            build_id_index: HashMap::new(),
            stats: PerfParserStats::default(),
        }
    }

    /// Seeds known filename -> build id pairs (from the perf.data build-id
    /// section) before parsing.
    pub fn set_build_ids(&mut self, build_ids: HashMap<String, String>) {
        self.build_id_index = build_ids;
    }

    pub fn events(&self) -> &[PerfEvent] {
        &self.events
    }

    pub fn parsed_events(&self) -> &[ParsedEvent] {
        &self.parsed_events
    }

    pub fn stats(&self) -> &PerfParserStats {
        &self.stats
    }

    pub fn dso_registry(&self) -> &DsoRegistry {
        &self.dso_registry
    }

    pub fn build_id_index(&self) -> &HashMap<String, String> {
        &self.build_id_index
    }

    pub fn options(&self) -> &PerfParserOptions {
        &self.options
    }

    /// Runs the full pipeline: pre-passes, the main resolution pass,
    /// build-id filling, threshold checks, and the optional discard pass.
    pub fn parse(&mut self) -> Result<(), ParseError> {
        if self.options.sort_events_by_time {
            // Stable, so events without a timestamp keep their order.
            self.events.sort_by_key(|e| e.timestamp().unwrap_or(0));
        }

        // Reset any state from a previous call.
        self.process_table = ProcessTable::new(self.page_alignment);
        self.command_table = CommandTable::new();
        self.dso_registry = DsoRegistry::new();

        if self.options.deduce_huge_page_mappings {
            huge_page::deduce_huge_pages(&mut self.events);
        }
        if self.options.combine_mappings {
            huge_page::combine_mappings(&mut self.events);
        }

        // FINISHED_ROUND events carry no payload and no timestamp; drop them
        // from the parsed sequence.
        self.parsed_events.clear();
        for (index, event) in self.events.iter().enumerate() {
            if event.header.kind == PERF_RECORD_FINISHED_ROUND {
                continue;
            }
            self.parsed_events.push(ParsedEvent {
                event_index: index,
                ..Default::default()
            });
        }

        self.process_events()?;

        if self.options.discard_unused_events {
            self.discard_unused_events();
        }
        Ok(())
    }

    fn process_events(&mut self) -> Result<(), ParseError> {
        self.stats = PerfParserStats::default();

        // The first mapping in kernel mode is the kernel image and needs the
        // normalization below. Later kernel-mode mappings are modules.
        let mut first_kernel_mmap = true;

        for parsed_index in 0..self.parsed_events.len() {
            let event_index = self.parsed_events[parsed_index].event_index;
            let header = self.events[event_index].header;

            if header.kind >= PERF_RECORD_USER_TYPE_START {
                trace!("parsed user event {}, doing nothing", event_name(header.kind));
                continue;
            }

            match header.kind {
                PERF_RECORD_SAMPLE => {
                    trace!("SAMPLE");
                    self.stats.num_sample_events += 1;
                    self.map_sample_event(parsed_index)?;
                }
                PERF_RECORD_MMAP | PERF_RECORD_MMAP2 => {
                    self.stats.num_mmap_events += 1;
                    let is_kernel = first_kernel_mmap
                        && header.misc & PERF_RECORD_MISC_CPUMODE_MASK == PERF_RECORD_MISC_KERNEL;
                    self.map_mmap_event(parsed_index, is_kernel)?;
                    // No samples in this region yet.
                    self.parsed_events[parsed_index].num_samples_in_mmap_region = 0;
                    if let Some(m) = self.events[event_index].mmap() {
                        trace!("{}: {}", event_name(header.kind), m.filename);
                        self.dso_registry
                            .observe(m, header.kind == PERF_RECORD_MMAP2);
                    }
                    if is_kernel {
                        first_kernel_mmap = false;
                    }
                }
                PERF_RECORD_FORK => {
                    self.stats.num_fork_events += 1;
                    self.map_fork_event(event_index);
                }
                PERF_RECORD_EXIT => {
                    // Same layout as FORK. Mappings are retained so late
                    // samples still resolve.
                    trace!("EXIT");
                    self.stats.num_exit_events += 1;
                }
                PERF_RECORD_COMM => {
                    self.stats.num_comm_events += 1;
                    if let Some(c) = self.events[event_index].comm() {
                        trace!("COMM: {}:{} {}", c.pid, c.tid, c.comm);
                        let (pid, tid) = (c.pid, c.tid);
                        self.command_table.insert(pid, tid, &c.comm);
                        self.process_table.get_or_create(pid, None);
                    }
                }
                PERF_RECORD_LOST
                | PERF_RECORD_THROTTLE
                | PERF_RECORD_UNTHROTTLE
                | PERF_RECORD_AUX
                | PERF_RECORD_ITRACE_START
                | PERF_RECORD_LOST_SAMPLES
                | PERF_RECORD_SWITCH
                | PERF_RECORD_SWITCH_CPU_WIDE
                | PERF_RECORD_NAMESPACES
                | PERF_RECORD_CGROUP => {
                    trace!("parsed event type {}, doing nothing", event_name(header.kind));
                }
                _ => {
                    error!("unknown event type {}", header.kind);
                    return Err(ParseError::UnknownEventType { kind: header.kind });
                }
            }
        }

        self.fill_in_dso_build_ids();

        info!(
            "parser processed: {} MMAP/MMAP2 events, {} COMM events, {} FORK events, \
             {} EXIT events, {} SAMPLE events, {} of these mapped, \
             {} SAMPLE events with a data address, {} of these mapped",
            self.stats.num_mmap_events,
            self.stats.num_comm_events,
            self.stats.num_fork_events,
            self.stats.num_exit_events,
            self.stats.num_sample_events,
            self.stats.num_sample_events_mapped,
            self.stats.num_data_sample_events,
            self.stats.num_data_sample_events_mapped,
        );

        if self.stats.num_sample_events == 0 {
            if self.options.sample_events_excluded {
                info!("input has no sample events; SAMPLE records were excluded by the decoder");
            } else {
                error!("input has no sample events");
                return Err(ParseError::NoSampleEvents);
            }
        } else {
            let mapped_percent = self.stats.num_sample_events_mapped as f64
                / self.stats.num_sample_events as f64
                * 100.0;
            let threshold = self.options.sample_mapping_percentage_threshold;
            if mapped_percent < threshold {
                error!(
                    "only {mapped_percent:.0}% of samples had all locations mapped to a module, \
                     expected at least {threshold:.0}%"
                );
                return Err(ParseError::InsufficientMappedSamples {
                    mapped_percent,
                    threshold,
                });
            }
        }
        self.stats.did_remap = self.options.do_remap;
        Ok(())
    }

    fn map_sample_event(&mut self, parsed_index: usize) -> Result<(), ParseError> {
        let event_index = self.parsed_events[parsed_index].event_index;
        let Some(sample) = self.events[event_index].sample() else {
            return Ok(());
        };
        let pidtid = (sample.pid, sample.tid);
        let original_ip = sample.ip;
        let addr = sample.addr;

        self.parsed_events[parsed_index].command = self.command_table.lookup(pidtid.0, pidtid.1);

        let mut mapping_ok = true;
        match self.map_ip_and_pid(original_ip, pidtid)? {
            Some(resolved) => {
                if let Some(sample) = self.events[event_index].sample_mut() {
                    sample.ip = resolved.ip;
                }
                self.parsed_events[parsed_index].dso_and_offset = Some(resolved);
            }
            None => mapping_ok = false,
        }

        if let Some(addr) = addr.filter(|&addr| addr != 0) {
            self.stats.num_data_sample_events += 1;
            if let Some(resolved) = self.map_ip_and_pid(addr, pidtid)? {
                self.stats.num_data_sample_events_mapped += 1;
                if let Some(sample) = self.events[event_index].sample_mut() {
                    sample.addr = Some(resolved.ip);
                }
                self.parsed_events[parsed_index].data_dso_and_offset = Some(resolved);
            }
        }

        if !self.map_callchain(parsed_index, pidtid, original_ip)? {
            mapping_ok = false;
        }
        if !self.map_branch_stack(parsed_index, pidtid)? {
            mapping_ok = false;
        }

        if mapping_ok {
            self.stats.num_sample_events_mapped += 1;
        }
        Ok(())
    }

    /// Resolves every callchain entry in place. Context markers pass through
    /// untouched; an entry equal to the sample's original IP is replaced by
    /// the already-resolved IP rather than resolved twice; entries that
    /// resolve to nothing are marked with [`UNMAPPED_ADDRESS_BIT`].
    fn map_callchain(
        &mut self,
        parsed_index: usize,
        pidtid: PidTid,
        original_ip: u64,
    ) -> Result<bool, ParseError> {
        let event_index = self.parsed_events[parsed_index].event_index;
        let Some(sample) = self.events[event_index].sample_mut() else {
            return Ok(true);
        };
        if sample.callchain.is_empty() {
            return Ok(true);
        }
        let resolved_ip = sample.ip;
        let mut callchain = std::mem::take(&mut sample.callchain);

        let mut mapping_ok = true;
        for entry in callchain.iter_mut() {
            if *entry >= PERF_CONTEXT_MAX {
                continue;
            }
            if *entry == original_ip {
                *entry = resolved_ip;
                continue;
            }
            match self.map_ip_and_pid(*entry, pidtid)? {
                Some(resolved) => {
                    *entry = resolved.ip;
                    self.parsed_events[parsed_index].callchain.push(resolved);
                }
                None => {
                    mapping_ok = false;
                    *entry |= UNMAPPED_ADDRESS_BIT;
                }
            }
        }

        if let Some(sample) = self.events[event_index].sample_mut() {
            sample.callchain = callchain;
        }
        Ok(mapping_ok)
    }

    /// Trims null padding off the branch stack, then resolves both endpoints
    /// of every surviving entry. A non-null entry after the first null one
    /// is a malformed record and fails the pass; an endpoint that resolves
    /// to nothing merely leaves the sample not-fully-mapped.
    fn map_branch_stack(
        &mut self,
        parsed_index: usize,
        pidtid: PidTid,
    ) -> Result<bool, ParseError> {
        let event_index = self.parsed_events[parsed_index].event_index;
        let Some(sample) = self.events[event_index].sample_mut() else {
            return Ok(true);
        };
        if sample.branch_stack.is_empty() {
            return Ok(true);
        }
        let mut branch_stack = std::mem::take(&mut sample.branch_stack);

        let trimmed = branch_stack
            .iter()
            .position(|entry| entry.is_null())
            .unwrap_or(branch_stack.len());
        if let Some(bad) = branch_stack[trimmed..].iter().find(|entry| !entry.is_null()) {
            error!(
                "non-null branch stack entry found after null entry: {:#x} -> {:#x}",
                bad.from_ip, bad.to_ip
            );
            return Err(ParseError::MalformedBranchStack {
                from_ip: bad.from_ip,
                to_ip: bad.to_ip,
            });
        }
        branch_stack.truncate(trimmed);

        let mut mapping_ok = true;
        for entry in branch_stack.iter_mut() {
            let Some(from) = self.map_ip_and_pid(entry.from_ip, pidtid)? else {
                mapping_ok = false;
                break;
            };
            entry.from_ip = from.ip;
            let Some(to) = self.map_ip_and_pid(entry.to_ip, pidtid)? else {
                mapping_ok = false;
                break;
            };
            entry.to_ip = to.ip;
            self.parsed_events[parsed_index].branch_stack.push(ParsedBranch {
                from,
                to,
                mispredicted: entry.mispredicted,
                predicted: entry.predicted,
                in_transaction: entry.in_transaction,
                abort: entry.abort,
                cycles: entry.cycles,
            });
        }

        if let Some(sample) = self.events[event_index].sample_mut() {
            sample.branch_stack = branch_stack;
        }
        Ok(mapping_ok)
    }

    /// Resolves one address against the map of `pidtid`'s process, creating
    /// the process entry if this is the first time the pid is seen. On a hit
    /// the owning DSO and MMAP are credited; `Ok(None)` means the address is
    /// simply not mapped.
    fn map_ip_and_pid(
        &mut self,
        ip: u64,
        pidtid: PidTid,
    ) -> Result<Option<ResolvedAddr>, ParseError> {
        let (mapper, _) = self.process_table.get_or_create(pidtid.0, None);
        let Some((mapped_addr, range)) = mapper.get_mapped_address(ip) else {
            return Ok(None);
        };
        let (id, offset) = mapper.get_mapped_id_and_offset(ip, range);
        let is_jit = range.is_jit;

        let mmap_index = id as usize;
        let event_index = self.parsed_events[mmap_index].event_index;
        let dso = self.events[event_index]
            .mmap()
            .and_then(|m| self.dso_registry.index_of(&m.filename))
            .expect("mapper region id refers to a registered MMAP event");

        let info = self.dso_registry.get_mut(dso);
        info.hit = true;
        info.threads.insert(pack_pid_tid(pidtid.0, pidtid.1));
        self.parsed_events[mmap_index].num_samples_in_mmap_region += 1;

        let new_ip = if self.options.do_remap {
            if !is_jit
                && self.page_alignment != 0
                && mapped_addr % self.page_alignment != ip % self.page_alignment
            {
                error!(
                    "remapped address {mapped_addr:#x} does not have the same page alignment \
                     offset as original address {ip:#x}"
                );
                return Err(ParseError::AlignmentViolation {
                    mapped: mapped_addr,
                    original: ip,
                });
            }
            mapped_addr
        } else {
            ip
        };

        Ok(Some(ResolvedAddr {
            dso,
            mmap_index,
            ip: new_ip,
            offset,
        }))
    }

    /// Inserts an MMAP's region into its process's map, normalizing kernel
    /// mappings first, and rewrites the event through the synthetic space
    /// when remapping is on.
    fn map_mmap_event(&mut self, parsed_index: usize, is_kernel: bool) -> Result<(), ParseError> {
        let event_index = self.parsed_events[parsed_index].event_index;
        let Some(m) = self.events[event_index].mmap() else {
            return Ok(());
        };
        let pid = m.pid;
        let mut start = m.start;
        let mut len = m.len;
        let mut pgoff = m.pgoff;
        let is_jit = self.options.allow_unaligned_jit_mappings && m.filename.contains("jitted-");
        let filename = m.filename.clone();

        // Kernel mmaps come in several shapes. ARM and x86 under sudo report
        // pgoff == start; x86-64 under sudo reports a pgoff between start
        // and start + len, with samples landing at and after pgoff; without
        // root the kernel is reported as [0, limit). Only the x86-64 shape
        // needs recentring onto the kernel text. In every kernel case pgoff
        // is zeroed: under ASLR it is the randomized load address, which
        // must not survive into the output.
        if is_kernel {
            if start
                .checked_add(len)
                .is_some_and(|end| pgoff > start && pgoff < end)
            {
                len = len + start - pgoff;
                start = pgoff;
            }
            pgoff = 0;
        }

        let (mapper, _) = self.process_table.get_or_create(pid, None);
        if !mapper.map_with_id(start, len, parsed_index as u64, pgoff, true, is_jit) {
            error!("unable to map {} event for {filename}", if is_kernel { "kernel MMAP" } else { "MMAP" });
            mapper.dump_to_log();
            return Err(ParseError::MmapInsertFailed {
                index: parsed_index,
                filename,
            });
        }

        if self.options.do_remap {
            let Some((mapped_addr, _)) = mapper.get_mapped_address(start) else {
                error!("failed to map starting address {start:#x} of {filename}");
                return Err(ParseError::MmapInsertFailed {
                    index: parsed_index,
                    filename,
                });
            };
            if !is_jit
                && self.page_alignment != 0
                && mapped_addr % self.page_alignment != start % self.page_alignment
            {
                error!(
                    "remapped address {mapped_addr:#x} does not have the same page alignment \
                     offset as start address {start:#x}"
                );
                return Err(ParseError::AlignmentViolation {
                    mapped: mapped_addr,
                    original: start,
                });
            }
            if let Some(m) = self.events[event_index].mmap_mut() {
                m.start = mapped_addr;
                m.len = len;
                m.pgoff = pgoff;
            }
        }
        Ok(())
    }

    fn map_fork_event(&mut self, event_index: usize) {
        let Some(fork) = self.events[event_index].fork().copied() else {
            return;
        };
        trace!(
            "FORK: {}:{} -> {}:{}",
            fork.ppid,
            fork.ptid,
            fork.pid,
            fork.tid
        );
        self.command_table
            .propagate((fork.ppid, fork.ptid), (fork.pid, fork.tid));

        // Parent pid == child pid is a new thread in the same process; the
        // memory map is shared, nothing to clone.
        if fork.ppid == fork.pid {
            return;
        }
        let (_, created) = self.process_table.get_or_create(fork.pid, Some(fork.ppid));
        if !created {
            trace!("found an existing process mapper with pid {}", fork.pid);
        }
    }

    /// Fills DSO build ids from the decoder-provided index, then (when
    /// enabled) from the filesystem for every DSO that was actually hit.
    /// Filesystem results are written back into the index.
    fn fill_in_dso_build_ids(&mut self) {
        for dso in self.dso_registry.iter_mut() {
            if let Some(build_id) = self.build_id_index.get(&dso.name) {
                dso.build_id = build_id.clone();
            }
            if self.options.read_missing_buildids && dso.hit {
                if let Some(bytes) = find_dso_build_id(dso) {
                    dso.build_id = hex::encode(bytes);
                    self.build_id_index
                        .insert(dso.name.clone(), dso.build_id.clone());
                }
            }
        }
    }

    /// Drops MMAP events whose region received no samples and rewrites the
    /// event buffer to the surviving order. Resolved addresses keep working:
    /// their parsed-event indices are rewritten along the way.
    fn discard_unused_events(&mut self) {
        let mut new_index = vec![usize::MAX; self.parsed_events.len()];
        let mut kept_count = 0;
        for (index, parsed) in self.parsed_events.iter().enumerate() {
            let unused_mmap = self.events[parsed.event_index].mmap().is_some()
                && parsed.num_samples_in_mmap_region == 0;
            if !unused_mmap {
                new_index[index] = kept_count;
                kept_count += 1;
            }
        }

        let mut kept = Vec::with_capacity(kept_count);
        for (index, parsed) in self.parsed_events.drain(..).enumerate() {
            if new_index[index] != usize::MAX {
                kept.push(parsed);
            }
        }
        // Any referenced MMAP has at least one sample in its region, so it
        // survived and has a new index.
        for parsed in &mut kept {
            for resolved in parsed
                .dso_and_offset
                .iter_mut()
                .chain(parsed.data_dso_and_offset.iter_mut())
                .chain(parsed.callchain.iter_mut())
            {
                resolved.mmap_index = new_index[resolved.mmap_index];
            }
            for branch in &mut parsed.branch_stack {
                branch.from.mmap_index = new_index[branch.from.mmap_index];
                branch.to.mmap_index = new_index[branch.to.mmap_index];
            }
        }
        self.parsed_events = kept;

        let mut slots: Vec<Option<PerfEvent>> = self.events.drain(..).map(Some).collect();
        let mut events = Vec::with_capacity(self.parsed_events.len());
        for parsed in &mut self.parsed_events {
            let event = slots[parsed.event_index]
                .take()
                .expect("parsed events reference distinct buffer slots");
            parsed.event_index = events.len();
            events.push(event);
        }
        self.events = events;
    }
}
