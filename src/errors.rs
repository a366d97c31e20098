//! The module for describing recoverable errors in `cliagg`.
//!
//! Error handling here follows the approach laid out in
//! [this error handling guide](https://blog.burntsushi.net/rust-error-handling/)
//! and in the source of the [csv crate](https://github.com/BurntSushi/rust-csv):
//! one enum covering every failure the binary can die from, a `Result` alias,
//! and `From` conversions so `?` works throughout the crate.
//!
//! Only *fatal* conditions become a `CsvCliError`: a malformed aggregation
//! spec, bad command-line values, and I/O failures on the output or the
//! scratch directory. Per-file and per-row problems (an input that will not
//! open, a named column missing from a header, a row with too few fields)
//! are logged to standard error and skipped, so they never appear here.

use std::error::Error;
use std::fmt;
use std::io;
use std::result;

/// An alias for the result type used across `cliagg`.
pub type CsvCliResult<T> = result::Result<T, CsvCliError>;

/// The set of errors that abort a run.
#[derive(Debug)]
pub enum CsvCliError {
    /// Errors from reading or writing CSV data.
    CsvError(csv::Error),
    /// Errors parsing the aggregation spec, like `count(),min(` or an
    /// aggregator name that does not exist.
    InvalidSpec(String),
    /// Errors in the initial configuration from command-line arguments,
    /// such as a `-L` value that is not a number.
    InvalidConfiguration(String),
    /// A standard IO error, typically from the output path.
    Io(io::Error),
    /// Failures creating, writing, or reading back the scratch files the
    /// group store spills to.
    Scratch(String),
}

impl fmt::Display for CsvCliError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CsvCliError::CsvError(ref err) => err.fmt(f),
            CsvCliError::InvalidSpec(ref err) => {
                write!(f, "Could not parse the aggregation spec: {}", err)
            }
            CsvCliError::InvalidConfiguration(ref err) => {
                write!(f, "Could not configure the aggregator: {}", err)
            }
            CsvCliError::Io(ref err) => err.fmt(f),
            CsvCliError::Scratch(ref err) => {
                write!(f, "Scratch directory failure: {}", err)
            }
        }
    }
}

impl Error for CsvCliError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            CsvCliError::CsvError(ref err) => Some(err),
            CsvCliError::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CsvCliError {
    fn from(err: io::Error) -> CsvCliError {
        CsvCliError::Io(err)
    }
}

impl From<csv::Error> for CsvCliError {
    fn from(err: csv::Error) -> CsvCliError {
        CsvCliError::CsvError(err)
    }
}
