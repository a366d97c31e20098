//! Buffered CSV output with explicit quoting control.
//!
//! The results file has a fixed per-field style: every string field is
//! quoted, with internal double quotes doubled, while integer fields go out
//! bare. `csv::Writer` only offers whole-file quote styles, so the handful
//! of helpers the emitters need live here instead.

use std::fs;
use std::io::{self, BufWriter, Write};

const BUF_CAPACITY: usize = 1 << 20;

/// A buffered writer over a file or standard output.
pub struct OutputSink {
    wtr: BufWriter<Box<dyn Write>>,
    /// True until the first field of the current row is written.
    row_start: bool,
}

impl OutputSink {
    /// Opens the output path, or standard output when `path` is `None`.
    pub fn open(path: Option<&str>) -> io::Result<OutputSink> {
        let inner: Box<dyn Write> = match path {
            Some(p) => Box::new(fs::File::create(p)?),
            None => Box::new(io::stdout()),
        };
        Ok(OutputSink {
            wtr: BufWriter::with_capacity(BUF_CAPACITY, inner),
            row_start: true,
        })
    }

    fn sep(&mut self) -> io::Result<()> {
        if self.row_start {
            self.row_start = false;
            Ok(())
        } else {
            self.wtr.write_all(b",")
        }
    }

    /// Writes one always-quoted field, doubling any internal quotes.
    pub fn field_quoted(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sep()?;
        self.wtr.write_all(b"\"")?;
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|&b| b == b'"') {
            self.wtr.write_all(&rest[..=pos])?;
            self.wtr.write_all(b"\"")?;
            rest = &rest[pos + 1..];
        }
        self.wtr.write_all(rest)?;
        self.wtr.write_all(b"\"")
    }

    /// Writes one bare integer field.
    pub fn field_int(&mut self, val: i64) -> io::Result<()> {
        self.sep()?;
        write!(self.wtr, "{}", val)
    }

    /// Terminates the current row.
    pub fn end_row(&mut self) -> io::Result<()> {
        self.row_start = true;
        self.wtr.write_all(b"\n")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.wtr.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A sink writing into a shared Vec so tests can inspect the bytes.
    fn capture() -> (OutputSink, std::rc::Rc<std::cell::RefCell<Vec<u8>>>) {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Shared(Rc<RefCell<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buf = Rc::new(RefCell::new(Vec::new()));
        let sink = OutputSink {
            wtr: BufWriter::new(Box::new(Shared(Rc::clone(&buf))) as Box<dyn Write>),
            row_start: true,
        };
        (sink, buf)
    }

    #[test]
    fn test_quoted_and_int_fields_share_a_row() {
        let (mut sink, buf) = capture();
        sink.field_quoted(b"nyc").unwrap();
        sink.field_int(2).unwrap();
        sink.end_row().unwrap();
        sink.flush().unwrap();
        assert_eq!(&*buf.borrow(), b"\"nyc\",2\n");
    }

    #[test]
    fn test_internal_quotes_are_doubled() {
        let (mut sink, buf) = capture();
        sink.field_quoted(b"say \"hi\" twice").unwrap();
        sink.end_row().unwrap();
        sink.flush().unwrap();
        assert_eq!(&*buf.borrow(), b"\"say \"\"hi\"\" twice\"\n");
    }

    #[test]
    fn test_negative_int_and_fresh_rows() {
        let (mut sink, buf) = capture();
        sink.field_int(-1).unwrap();
        sink.end_row().unwrap();
        sink.field_quoted(b"").unwrap();
        sink.end_row().unwrap();
        sink.flush().unwrap();
        assert_eq!(&*buf.borrow(), b"-1\n\"\"\n");
    }
}
