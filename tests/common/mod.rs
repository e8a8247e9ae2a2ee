//! Shared event builders and a recording handler for integration tests.
#![allow(dead_code)]

use std::rc::Rc;

use perfnorm::event::{
    BranchStackEntry, CommEvent, EventData, EventHeader, ForkEvent, MmapEvent, PerfEvent,
    SampleEvent, PERF_RECORD_COMM, PERF_RECORD_FORK, PERF_RECORD_MISC_KERNEL, PERF_RECORD_MMAP,
    PERF_RECORD_SAMPLE,
};
use perfnorm::normalizer::{CommContext, MmapContext, SampleContext};
use perfnorm::{Mapping, PerfDataHandler, PerfParserOptions, KERNEL_PID};

pub const PAGE: u64 = 4096;

/// Baseline options for tests: deterministic page size, no time sort, no
/// mapping floor.
pub fn test_options() -> PerfParserOptions {
    PerfParserOptions {
        sort_events_by_time: false,
        sample_mapping_percentage_threshold: 0.0,
        page_alignment: Some(PAGE),
        ..Default::default()
    }
}

pub fn mmap_event(pid: u32, start: u64, len: u64, pgoff: u64, filename: &str) -> PerfEvent {
    PerfEvent {
        header: EventHeader {
            kind: PERF_RECORD_MMAP,
            ..Default::default()
        },
        data: EventData::Mmap(MmapEvent {
            pid,
            tid: pid,
            start,
            len,
            pgoff,
            filename: filename.to_string(),
            ..Default::default()
        }),
    }
}

pub fn kernel_mmap_event(start: u64, len: u64, pgoff: u64) -> PerfEvent {
    let mut event = mmap_event(KERNEL_PID, start, len, pgoff, "[kernel.kallsyms]_text");
    event.header.misc = PERF_RECORD_MISC_KERNEL;
    event
}

pub fn sample_event(pid: u32, tid: u32, ip: u64) -> PerfEvent {
    PerfEvent {
        header: EventHeader {
            kind: PERF_RECORD_SAMPLE,
            ..Default::default()
        },
        data: EventData::Sample(SampleEvent {
            pid,
            tid,
            ip,
            ..Default::default()
        }),
    }
}

pub fn sample_with_callchain(pid: u32, tid: u32, ip: u64, callchain: Vec<u64>) -> PerfEvent {
    let mut event = sample_event(pid, tid, ip);
    if let EventData::Sample(s) = &mut event.data {
        s.callchain = callchain;
    }
    event
}

pub fn sample_with_branch_stack(
    pid: u32,
    tid: u32,
    ip: u64,
    branch_stack: Vec<(u64, u64)>,
) -> PerfEvent {
    let mut event = sample_event(pid, tid, ip);
    if let EventData::Sample(s) = &mut event.data {
        s.branch_stack = branch_stack
            .into_iter()
            .map(|(from_ip, to_ip)| BranchStackEntry {
                from_ip,
                to_ip,
                ..Default::default()
            })
            .collect();
    }
    event
}

pub fn comm_event(pid: u32, tid: u32, comm: &str) -> PerfEvent {
    PerfEvent {
        header: EventHeader {
            kind: PERF_RECORD_COMM,
            ..Default::default()
        },
        data: EventData::Comm(CommEvent {
            pid,
            tid,
            comm: comm.to_string(),
            ..Default::default()
        }),
    }
}

pub fn fork_event(ppid: u32, pid: u32) -> PerfEvent {
    PerfEvent {
        header: EventHeader {
            kind: PERF_RECORD_FORK,
            ..Default::default()
        },
        data: EventData::Fork(ForkEvent {
            pid,
            ppid,
            tid: pid,
            ptid: ppid,
            time: None,
        }),
    }
}

/// Owned copy of one sample callback.
pub struct RecordedSample {
    pub pid: u32,
    pub tid: u32,
    pub ip: u64,
    pub main_mapping: Option<Rc<Mapping>>,
    pub sample_mapping: Option<Rc<Mapping>>,
    pub addr_mapping: Option<Rc<Mapping>>,
    pub callchain: Vec<(u64, Option<Rc<Mapping>>)>,
    pub branch_stack: Vec<((u64, Option<Rc<Mapping>>), (u64, Option<Rc<Mapping>>))>,
}

/// Handler that records every callback for later assertions.
#[derive(Default)]
pub struct Recorder {
    pub mmaps: Vec<(Rc<Mapping>, u32)>,
    pub comms: Vec<(u32, u32, String, bool)>,
    pub samples: Vec<RecordedSample>,
}

impl PerfDataHandler for Recorder {
    fn sample(&mut self, sample: SampleContext<'_>) {
        self.samples.push(RecordedSample {
            pid: sample.sample.pid,
            tid: sample.sample.tid,
            ip: sample.sample.ip,
            main_mapping: sample.main_mapping,
            sample_mapping: sample.sample_mapping,
            addr_mapping: sample.addr_mapping,
            callchain: sample
                .callchain
                .into_iter()
                .map(|location| (location.ip, location.mapping))
                .collect(),
            branch_stack: sample
                .branch_stack
                .into_iter()
                .map(|pair| {
                    (
                        (pair.from.ip, pair.from.mapping),
                        (pair.to.ip, pair.to.mapping),
                    )
                })
                .collect(),
        });
    }

    fn comm(&mut self, comm: CommContext<'_>) {
        self.comms.push((
            comm.comm.pid,
            comm.comm.tid,
            comm.comm.comm.clone(),
            comm.is_exec,
        ));
    }

    fn mmap(&mut self, mmap: MmapContext) {
        self.mmaps.push((mmap.mapping, mmap.pid));
    }
}
