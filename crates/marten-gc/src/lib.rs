//! # Marten GC
//!
//! A conservative, precise-per-allocation mark-and-sweep garbage collector
//! for single-threaded hosts.
//!
//! ## Design
//!
//! - **Explicit allocation API**: the mutator requests memory through a
//!   [`Collector`] value; nothing is intercepted
//! - **Precise metadata, conservative roots**: every allocation has an
//!   exact record (address, size, tags, finaliser) in an internally-owned
//!   address-keyed table; reachability is discovered conservatively from
//!   tagged roots and the mutator stack
//! - **Inline collection**: mark and sweep run synchronously on the
//!   mutator thread, on demand or when an allocation crosses the table's
//!   sweep limit
//! - **Per-allocation finalisers**: invoked exactly once, by explicit free
//!   or by sweep
//! - **Prime-capacity table**: separate chaining with load-factor driven
//!   resizing, never below the configured floor
//!
//! ## Usage
//!
//! ```
//! use marten_gc::{Collector, StackBase};
//!
//! let anchor = 0usize;
//! let mut gc = Collector::new(StackBase::new(&anchor));
//!
//! let region = gc.alloc(64).expect("out of memory");
//! gc.make_root(region.as_ptr());
//!
//! let reclaimed = gc.run();
//! assert_eq!(reclaimed, 0); // the root survives
//! gc.shutdown();
//! ```
//!
//! ## Caveats
//!
//! The stack scan reads every word between the collector's stack-base
//! sentinel and the live top of stack, so the sentinel must be captured in
//! a frame the mutator never returns past, and collections must be
//! initiated from frames deeper than it. Register state is flushed into
//! the scanned range first; on targets without a spill primitive a pointer
//! held only in a register may be missed. Finalisers must never re-enter
//! the collector they run under.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod collector;
pub mod config;
pub mod error;
pub mod global;
pub mod stats;

mod primes;
mod raw;
mod record;
mod stack;
mod table;

pub use collector::{Collector, GcPhase};
pub use config::GcConfig;
pub use error::{GcError, GcResult};
pub use record::Finalizer;
pub use stack::StackBase;
pub use stats::GcStats;
