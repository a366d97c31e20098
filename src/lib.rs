//! `cliagg` is a command-line tool for streaming group-by aggregation over
//! CSV files.
//!
//! If you want to use the program, the `-h` output covers the whole surface:
//! you hand it an aggregation spec like `downcase(city),min(pop),count()`
//! plus some CSV files, and it writes one aggregated CSV. If, on the other
//! hand, you want to work on `cliagg` itself, read on.
//!
//! The place to start is the `aggregation` module, which owns the engine and
//! is the only module that knows how the others fit together. From there:
//!
//! - `parsing` compiles the spec string into a `Plan` of output columns.
//! - `aggfunc` holds the closed set of aggregation functions and the `Cell`
//!   accumulator they fold into.
//! - `arena` and `table` are the storage half: group-key bytes live in the
//!   arena for the whole run, and group tuples live in a store that can
//!   spill cold buckets to a scratch directory when the working set
//!   outgrows memory.
//! - `reader` and `output` are thin I/O edges around the csv crate and a
//!   buffered writer.
//!
//! Two properties are worth knowing before changing anything. Group
//! identity is the tuple of *normalized* key fields, hashed in column order
//! with absent fields contributing nothing, so any change to key handling
//! has to keep an empty field distinct from an absent one. And emission is
//! destructive: writing results consumes the engine, because each owned
//! cell gives up its storage as it is written.
//!
//! Aggregation output feeds back in through the `-m` flag, which folds
//! partial outputs together (the reduce half of a map-reduce batch), so the
//! output format and the merge parser have to stay in sync.

pub mod aggfunc;
pub mod aggregation;
pub mod arena;
pub mod errors;
pub mod output;
pub mod parsing;
pub mod reader;
pub mod table;
