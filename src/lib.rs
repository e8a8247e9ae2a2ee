//! perfnorm - normalization of decoded Linux perf event streams.
//!
//! The input is a decoded perf.data event sequence (samples, memory
//! mappings, process lifecycle); the output is a stream of callbacks in
//! which every instruction pointer, data address, callchain entry, and
//! branch endpoint has been resolved to a concrete memory mapping and,
//! optionally, remapped into a compact synthetic address space that hides
//! the real kernel layout.
//!
//! # Modules
//!
//! - [`address_mapper`] - per-process interval map with synthetic address
//!   assignment
//! - [`process_table`] - pid -> mapper ownership and fork inheritance
//! - [`command_table`] - interned command names per (pid, tid)
//! - [`dso`] - DSO registry and filesystem build-id lookup
//! - [`huge_page`] - optional pre-passes folding huge-page and split
//!   mappings
//! - [`parser`] - the event pipeline itself
//! - [`normalizer`] - the consumer-facing handler trait and callbacks
//!
//! # Example
//!
//! ```no_run
//! use perfnorm::{process, PerfDataHandler, PerfParserOptions};
//! use perfnorm::normalizer::{CommContext, MmapContext, SampleContext};
//!
//! struct Printer;
//!
//! impl PerfDataHandler for Printer {
//!     fn sample(&mut self, sample: SampleContext<'_>) {
//!         if let Some(mapping) = &sample.sample_mapping {
//!             println!("{:#x} in {}", sample.sample.ip, mapping.filename);
//!         }
//!     }
//!     fn comm(&mut self, _comm: CommContext<'_>) {}
//!     fn mmap(&mut self, _mmap: MmapContext) {}
//! }
//!
//! let events = vec![/* decoded perf events */];
//! let options = PerfParserOptions {
//!     do_remap: true,
//!     ..Default::default()
//! };
//! process(events, options, &mut Printer).expect("processing failed");
//! ```

pub mod address_mapper;
pub mod command_table;
pub mod dso;
pub mod error;
pub mod event;
pub mod huge_page;
pub mod normalizer;
pub mod parser;
pub mod process_table;
pub mod utils;

// Re-export for convenience
pub use address_mapper::AddressMapper;
pub use error::ParseError;
pub use normalizer::{process, Mapping, PerfDataHandler};
pub use parser::{PerfParser, PerfParserOptions, PerfParserStats, UNMAPPED_ADDRESS_BIT};
pub use process_table::KERNEL_PID;
