//! Row-at-a-time CSV input over a file or standard input.
//!
//! The csv crate does the heavy lifting (line framing, field splitting,
//! quote unescaping); this module just pins down the configuration every
//! input is read with. Readers are built `flexible`, because rows with the
//! wrong field count are the engine's business to skip and report, not a
//! reason to abort the file.

use std::fs;
use std::io;

use crate::errors::CsvCliResult;

/// How much of a bad row is echoed in a diagnostic.
const SNIPPET_MAX: usize = 32;

/// A CSV reader over a file, or standard input when no path is given.
pub struct RowReader {
    rdr: csv::Reader<Box<dyn io::Read>>,
}

impl RowReader {
    /// Opens `path` (or stdin) with the standard settings: comma separator,
    /// double-quote quoting, a required header row, and a read buffer sized
    /// by `line_max`.
    pub fn open(path: Option<&str>, line_max: usize) -> io::Result<RowReader> {
        let inner: Box<dyn io::Read> = match path {
            Some(p) => Box::new(fs::File::open(p)?),
            None => Box::new(io::stdin()),
        };
        let rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .buffer_capacity(line_max)
            .from_reader(inner);
        Ok(RowReader { rdr })
    }

    /// The header row. Position is remembered by the underlying reader, so
    /// data rows are unaffected by when this is called.
    pub fn headers(&mut self) -> CsvCliResult<csv::ByteRecord> {
        Ok(self.rdr.byte_headers()?.clone())
    }

    /// Reads the next data row into `record`. Returns false at the end of
    /// the stream.
    pub fn read_row(&mut self, record: &mut csv::ByteRecord) -> CsvCliResult<bool> {
        Ok(self.rdr.read_byte_record(record)?)
    }
}

/// A short printable excerpt of a record, for row-skip diagnostics.
pub fn snippet(record: &csv::ByteRecord) -> String {
    let mut joined = Vec::new();
    for field in record.iter() {
        if !joined.is_empty() {
            joined.push(b',');
        }
        joined.extend_from_slice(field);
        if joined.len() >= SNIPPET_MAX {
            break;
        }
    }
    joined.truncate(SNIPPET_MAX);
    String::from_utf8_lossy(&joined).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reads_header_then_rows() {
        let file = write_fixture("city,pop\nNYC,8000000\n\"LA\",4000000\n");
        let mut rdr = RowReader::open(file.path().to_str(), 64 * 1024).unwrap();
        let headers = rdr.headers().unwrap();
        assert_eq!(headers, vec!["city", "pop"]);
        let mut record = csv::ByteRecord::new();
        assert!(rdr.read_row(&mut record).unwrap());
        assert_eq!(&record[0], b"NYC");
        assert!(rdr.read_row(&mut record).unwrap());
        assert_eq!(&record[0], b"LA");
        assert!(!rdr.read_row(&mut record).unwrap());
    }

    #[test]
    fn test_flexible_rows_come_through() {
        let file = write_fixture("a,b,c\n1,2\n1,2,3,4\n");
        let mut rdr = RowReader::open(file.path().to_str(), 64 * 1024).unwrap();
        rdr.headers().unwrap();
        let mut record = csv::ByteRecord::new();
        assert!(rdr.read_row(&mut record).unwrap());
        assert_eq!(record.len(), 2);
        assert!(rdr.read_row(&mut record).unwrap());
        assert_eq!(record.len(), 4);
    }

    #[test]
    fn test_quoted_fields_are_unescaped() {
        let file = write_fixture("s\n\"say \"\"hi\"\", ok\"\n");
        let mut rdr = RowReader::open(file.path().to_str(), 64 * 1024).unwrap();
        rdr.headers().unwrap();
        let mut record = csv::ByteRecord::new();
        assert!(rdr.read_row(&mut record).unwrap());
        assert_eq!(&record[0], b"say \"hi\", ok");
    }

    #[test]
    fn test_snippet_truncates() {
        let record = csv::ByteRecord::from(vec!["x".repeat(50)]);
        assert_eq!(snippet(&record).len(), SNIPPET_MAX);
        let short = csv::ByteRecord::from(vec!["a", "b"]);
        assert_eq!(snippet(&short), "a,b");
    }

    #[test]
    fn test_open_missing_file_fails() {
        assert!(RowReader::open(Some("definitely/not/here.csv"), 1024).is_err());
    }
}
