//! Optional pre-passes over the event buffer, run before parsing.
//!
//! Transparent huge pages show up in perf data as anonymous mappings wedged
//! between (or in front of) the file-backed mappings they actually belong
//! to, and large binaries are often mapped in several contiguous pieces.
//! Both effects make one DSO look like several mappings. The passes here
//! fold huge-page mappings back into their neighbours and coalesce split
//! mappings, mutating the buffer in place and preserving the relative order
//! of untouched events.

use std::collections::HashMap;

use tracing::trace;

use crate::event::{EventData, MmapEvent, PerfEvent};

/// Filenames the kernel reports for transparent-huge-page mappings.
fn is_anon_huge_page(filename: &str) -> bool {
    filename == "//anon"
        || filename == "/anon_hugepage"
        || filename == "/anon_hugepage (deleted)"
}

fn is_file_backed(filename: &str) -> bool {
    filename.starts_with('/') && !is_anon_huge_page(filename)
}

fn contiguous(prev: &MmapEvent, next: &MmapEvent) -> bool {
    prev.start.checked_add(prev.len) == Some(next.start)
}

/// Folds anonymous huge-page mappings into the adjacent file-backed mapping
/// of the same process. A huge-page mapping that directly precedes a file
/// mapping takes that file's name and the file offset implied by contiguity;
/// one that directly follows extends the file forward.
pub fn deduce_huge_pages(events: &mut [PerfEvent]) {
    let mut mmap_indices: HashMap<u32, Vec<usize>> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        if let EventData::Mmap(m) = &event.data {
            mmap_indices.entry(m.pid).or_default().push(index);
        }
    }

    for indices in mmap_indices.values() {
        for pair in indices.windows(2) {
            let (left, right) = events.split_at_mut(pair[1]);
            let (Some(prev), Some(cur)) = (left[pair[0]].mmap_mut(), right[0].mmap_mut()) else {
                continue;
            };
            if !contiguous(prev, cur) {
                continue;
            }

            if is_anon_huge_page(&prev.filename) && is_file_backed(&cur.filename) {
                // The huge pages hold the start of the file; the file-backed
                // mapping begins prev.len bytes in.
                if cur.pgoff >= prev.len {
                    trace!(
                        "deduced huge page mapping at {:#x} as start of {}",
                        prev.start,
                        cur.filename
                    );
                    prev.filename = cur.filename.clone();
                    prev.pgoff = cur.pgoff - prev.len;
                    prev.maj = cur.maj;
                    prev.min = cur.min;
                    prev.ino = cur.ino;
                    prev.ino_generation = cur.ino_generation;
                }
            } else if is_file_backed(&prev.filename) && is_anon_huge_page(&cur.filename) {
                // The huge pages continue the file past the end of the
                // file-backed mapping.
                trace!(
                    "deduced huge page mapping at {:#x} as continuation of {}",
                    cur.start,
                    prev.filename
                );
                cur.filename = prev.filename.clone();
                cur.pgoff = prev.pgoff + prev.len;
                cur.maj = prev.maj;
                cur.min = prev.min;
                cur.ino = prev.ino;
                cur.ino_generation = prev.ino_generation;
            }
        }
    }
}

/// Coalesces mappings of the same file that are contiguous in both the
/// address space and the backing file. The later event is dropped from the
/// buffer; everything else keeps its relative order.
pub fn combine_mappings(events: &mut Vec<PerfEvent>) {
    let mut combined: Vec<PerfEvent> = Vec::with_capacity(events.len());
    let mut last_mmap_by_pid: HashMap<u32, usize> = HashMap::new();

    for event in events.drain(..) {
        let pid = match &event.data {
            EventData::Mmap(m) => {
                let mergeable = last_mmap_by_pid
                    .get(&m.pid)
                    .and_then(|&index| combined[index].mmap())
                    .is_some_and(|prev| {
                        prev.filename == m.filename
                            && contiguous(prev, m)
                            && prev.pgoff.checked_add(prev.len) == Some(m.pgoff)
                            && (prev.maj, prev.min, prev.ino) == (m.maj, m.min, m.ino)
                    });
                if mergeable {
                    let index = last_mmap_by_pid[&m.pid];
                    let prev = combined[index]
                        .mmap_mut()
                        .expect("combined index points at an MMAP event");
                    trace!(
                        "combining split mapping of {} at {:#x}",
                        prev.filename,
                        m.start
                    );
                    prev.len += m.len;
                    continue;
                }
                Some(m.pid)
            }
            _ => None,
        };

        combined.push(event);
        if let Some(pid) = pid {
            last_mmap_by_pid.insert(pid, combined.len() - 1);
        }
    }

    *events = combined;
}
