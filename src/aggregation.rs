//! The `aggregation` module is the part of `cliagg` that works directly with
//! command-line arguments and drives everything else.
//!
//! The `main` binary hands clap's matches to [`CliConfig::from_arg_matches`],
//! then calls [`run`]. `run` compiles the spec into a [`Plan`], builds an
//! [`Aggregator`] around it, feeds every input file through either the
//! aggregation loop or the merge loop, and finally asks the aggregator to
//! write the result CSV.
//!
//! The `Aggregator` owns the run's state: the plan, the byte arena holding
//! every group's key bytes, and the group store holding every group's
//! accumulator tuple. Rows stream through one at a time. For each accepted
//! row the engine normalizes the key fields, hashes them into a single
//! 64-bit composite hash, locates or creates the group (comparing key bytes
//! through the arena to resolve hash collisions), and dispatches each
//! interesting field to the aggregators that consume it.
//!
//! Problems with a *file* (it will not open, a named column is missing, a
//! merge header does not line up) skip that file with a note on standard
//! error; problems with a *row* (too few fields) skip that row the same way.
//! Neither fails the run, which is what lets a long batch keep going when
//! one shard is bad.

use std::hash::{BuildHasher, Hasher};
use std::path::Path;

use ahash::RandomState;
use clap::{crate_version, App, Arg, ArgMatches};

use crate::aggfunc::{AggFunc, Cell};
use crate::arena::{KeyArena, KeyRef};
use crate::errors::{CsvCliError, CsvCliResult};
use crate::output::OutputSink;
use crate::parsing::Plan;
use crate::reader::{snippet, RowReader};
use crate::table::{PageStore, SlotId, DEFAULT_RESIDENT_GROUPS};

/// Default cap on the reader's line buffer, overridable with `-L`.
pub const DEFAULT_LINE_MAX: usize = 64 * 1024;

/// How one input file's header maps onto the plan. Rebuilt for every file,
/// which is what lets the same plan run over inputs whose columns sit in
/// different positions.
struct FileBinding {
    /// Key columns as (plan slot, input column index, function).
    keys: Vec<(usize, usize, AggFunc)>,
    /// Value aggregators grouped by the input column that feeds them, so a
    /// field is unescaped once and every aggregator bound to it reads the
    /// same byte slice.
    values: Vec<(usize, Vec<(usize, AggFunc)>)>,
    /// Value aggregators bound to no input column, like `count()`.
    others: Vec<(usize, AggFunc)>,
    /// The file's header width. Rows with fewer fields are skipped, even
    /// when the missing fields feed nothing; extra fields beyond the header
    /// are dropped.
    min_fields: usize,
}

/// The main struct for aggregating CSV files.
pub struct Aggregator {
    plan: Plan,
    arena: KeyArena,
    table: PageStore,
    random_state: RandomState,
    line_max: usize,
}

impl Aggregator {
    /// Builds an engine for `plan`. When a scratch directory is given the
    /// group store may spill cold groups there instead of growing without
    /// bound.
    pub fn new(plan: Plan, scratch: Option<&str>, line_max: usize) -> CsvCliResult<Aggregator> {
        let table = match scratch {
            Some(dir) => {
                PageStore::with_spill(plan.width(), Path::new(dir), DEFAULT_RESIDENT_GROUPS)?
            }
            None => PageStore::new(plan.width()),
        };
        Ok(Aggregator {
            plan,
            arena: KeyArena::new(),
            table,
            // Fixed seeds keep a run deterministic; the hash never leaves
            // the process, so they carry no compatibility burden.
            random_state: RandomState::with_seeds(0x5aa5, 0x3cc3, 0x9669, 0xf00f),
            line_max,
        })
    }

    /// The number of groups currently stored.
    pub fn group_count(&self) -> usize {
        self.table.len()
    }

    /// Maps the plan onto one file's header row. Any named column that the
    /// header lacks makes the whole file unusable.
    fn resolve(&self, headers: &csv::ByteRecord) -> Result<FileBinding, String> {
        let header_vec: Vec<&[u8]> = headers.iter().collect();
        let mut keys = Vec::new();
        let mut values: Vec<(usize, Vec<(usize, AggFunc)>)> = Vec::new();
        let mut others = Vec::new();
        // A row is acceptable only when it carries the full header's worth
        // of fields, whether or not the plan reads them all.
        let min_fields = header_vec.len();

        for col in self.plan.columns() {
            match col.input {
                Some(ref name) => {
                    let idx = header_vec
                        .iter()
                        .position(|h| h.eq_ignore_ascii_case(name.as_bytes()))
                        .ok_or_else(|| format!("column not found: {}", name))?;
                    if col.func.is_key() {
                        keys.push((col.slot, idx, col.func));
                    } else {
                        match values.iter_mut().find(|(i, _)| *i == idx) {
                            Some((_, targets)) => targets.push((col.slot, col.func)),
                            None => values.push((idx, vec![(col.slot, col.func)])),
                        }
                    }
                }
                None => {
                    // A key function with no input column never contributes
                    // to the key; a value function with no input still runs
                    // once per row.
                    if !col.func.is_key() {
                        others.push((col.slot, col.func));
                    }
                }
            }
        }

        Ok(FileBinding {
            keys,
            values,
            others,
            min_fields,
        })
    }

    /// The composite group hash: every present key entry in slot order,
    /// length-framed so that an empty field is distinct from an absent one.
    fn hash_keys(&self, keys: &[Option<Vec<u8>>]) -> u64 {
        let mut hasher = self.random_state.build_hasher();
        for key in keys {
            if let Some(bytes) = key {
                hasher.write_u64(bytes.len() as u64);
                hasher.write(bytes);
            }
        }
        hasher.finish()
    }

    /// Locates the group for the current row's keys, or creates it, copying
    /// the key bytes into the arena. The bool is true when the group is
    /// fresh, which tells every aggregator to initialize rather than fold.
    fn find_or_create(
        &mut self,
        hash: u64,
        keys: &[Option<Vec<u8>>],
    ) -> CsvCliResult<(SlotId, bool)> {
        let arena = &self.arena;
        let found = self.table.find(hash, |cells| {
            keys.iter().enumerate().all(|(slot, key)| match key {
                None => true,
                Some(bytes) => match &cells[slot] {
                    Cell::Key(kref) => arena.get(*kref) == bytes.as_slice(),
                    _ => false,
                },
            })
        })?;
        if let Some(id) = found {
            return Ok((id, false));
        }

        let mut krefs: Vec<(usize, KeyRef)> = Vec::new();
        for (slot, key) in keys.iter().enumerate() {
            if let Some(bytes) = key {
                krefs.push((slot, self.arena.alloc(bytes)));
            }
        }
        let id = self.table.insert(hash)?;
        let cells = self.table.cells_mut(id)?;
        for (slot, kref) in krefs {
            cells[slot] = Cell::Key(kref);
        }
        Ok((id, true))
    }

    /// Reads one input file (stdin when `path` is `None`) and folds every
    /// acceptable row into the group store.
    pub fn aggregate(&mut self, path: Option<&str>) -> CsvCliResult<()> {
        let label = path.unwrap_or("<stdin>").to_string();
        let mut reader = match RowReader::open(path, self.line_max) {
            Ok(reader) => reader,
            Err(err) => {
                eprintln!("{}: {}, skipping file", label, err);
                return Ok(());
            }
        };
        let headers = match reader.headers() {
            Ok(headers) => headers,
            Err(err) => {
                eprintln!("{}: {}, skipping file", label, err);
                return Ok(());
            }
        };
        let binding = match self.resolve(&headers) {
            Ok(binding) => binding,
            Err(reason) => {
                eprintln!("{}: {}, skipping file", label, reason);
                return Ok(());
            }
        };

        let mut record = csv::ByteRecord::new();
        let mut keys: Vec<Option<Vec<u8>>> = vec![None; self.plan.width()];
        loop {
            match reader.read_row(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    eprintln!("{}: {}, skipping rest of file", label, err);
                    break;
                }
            }
            if record.len() < binding.min_fields {
                eprintln!("Bad field count, skipping line near {}", snippet(&record));
                continue;
            }

            for &(slot, idx, func) in &binding.keys {
                let mut bytes = record[idx].to_vec();
                func.normalize_key(&mut bytes);
                keys[slot] = Some(bytes);
            }
            let hash = self.hash_keys(&keys);
            let (id, first) = self.find_or_create(hash, &keys)?;
            let cells = self.table.cells_mut(id)?;

            for (idx, targets) in &binding.values {
                let field = &record[*idx];
                for &(slot, func) in targets {
                    func.step(&mut cells[slot], Some(field), first);
                }
            }
            for &(slot, func) in &binding.others {
                func.step(&mut cells[slot], None, first);
            }
        }
        Ok(())
    }

    /// Reads a previous run's output and folds it in (the reduce half of a
    /// map-reduce batch). The file's header must match the plan's output
    /// names in order and count, or the file is skipped.
    pub fn merge(&mut self, path: Option<&str>) -> CsvCliResult<()> {
        let label = path.unwrap_or("<stdin>").to_string();
        let mut reader = match RowReader::open(path, self.line_max) {
            Ok(reader) => reader,
            Err(err) => {
                eprintln!("{}: {}, skipping file", label, err);
                return Ok(());
            }
        };
        let headers = match reader.headers() {
            Ok(headers) => headers,
            Err(err) => {
                eprintln!("{}: {}, skipping file", label, err);
                return Ok(());
            }
        };
        if headers.len() != self.plan.width() {
            eprintln!("{}: merge: column count differs, skipping file", label);
            return Ok(());
        }
        for (header, col) in headers.iter().zip(self.plan.columns()) {
            if !header.eq_ignore_ascii_case(col.name.as_bytes()) {
                eprintln!(
                    "{}: merge: columns do not match ({} != {}), skipping file",
                    label,
                    String::from_utf8_lossy(header),
                    col.name
                );
                return Ok(());
            }
        }

        let width = self.plan.width();
        let columns: Vec<AggFunc> = self.plan.columns().iter().map(|c| c.func).collect();
        let mut record = csv::ByteRecord::new();
        let mut keys: Vec<Option<Vec<u8>>> = vec![None; width];
        loop {
            match reader.read_row(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    eprintln!("{}: {}, skipping rest of file", label, err);
                    break;
                }
            }
            if record.len() < width {
                eprintln!("Bad field count, skipping line near {}", snippet(&record));
                continue;
            }

            for (slot, func) in columns.iter().enumerate() {
                if func.is_key() {
                    let mut bytes = record[slot].to_vec();
                    func.normalize_key(&mut bytes);
                    keys[slot] = Some(bytes);
                }
            }
            let hash = self.hash_keys(&keys);
            let (id, first) = self.find_or_create(hash, &keys)?;
            let cells = self.table.cells_mut(id)?;

            for (slot, func) in columns.iter().enumerate() {
                if !func.is_key() {
                    func.merge(&mut cells[slot], &record[slot], first);
                }
            }
        }
        Ok(())
    }

    /// Writes the header row and one row per group, consuming the engine.
    /// Emission hands each owned cell's storage back as it goes, which is
    /// why results can only be written once.
    pub fn write_results(self, path: Option<&str>) -> CsvCliResult<()> {
        let Aggregator {
            plan, arena, table, ..
        } = self;
        let mut out = OutputSink::open(path)?;

        for col in plan.columns() {
            out.field_quoted(col.name.as_bytes())?;
        }
        out.end_row()?;

        let funcs: Vec<AggFunc> = plan.columns().iter().map(|c| c.func).collect();
        for group in table.into_groups() {
            let mut cells = group?;
            for (slot, func) in funcs.iter().enumerate() {
                func.emit(&mut cells[slot], &arena, &mut out)?;
            }
            out.end_row()?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Everything the command line decides, in one place.
#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    spec: String,
    files: Vec<String>,
    output: Option<String>,
    line_max: usize,
    merge: bool,
    scratch: Option<String>,
}

impl CliConfig {
    /// Takes argument matches from main and tries to convert them into a
    /// `CliConfig`.
    pub fn from_arg_matches(matches: &ArgMatches) -> CsvCliResult<CliConfig> {
        // unwrap safe because clap marks the spec as required
        let spec = matches.value_of("spec").unwrap().to_string();
        let files = matches
            .values_of("file")
            .map_or(vec![], |it| it.map(String::from).collect());
        let line_max = match matches.value_of("line-max") {
            Some(raw) => raw.parse().map_err(|_| {
                CsvCliError::InvalidConfiguration(format!(
                    "`-L {}` is not a number of bytes",
                    raw
                ))
            })?,
            None => DEFAULT_LINE_MAX,
        };
        Ok(CliConfig {
            spec,
            files,
            output: matches.value_of("output").map(String::from),
            line_max,
            merge: matches.is_present("merge"),
            scratch: matches.value_of("scratch").map(String::from),
        })
    }
}

/// Builds the clap app for the binary (and for tests that drive it).
pub fn build_app() -> App<'static, 'static> {
    App::new("cliagg")
        .version(crate_version!())
        .about("Streaming group-by aggregation over CSV files")
        .arg(
            Arg::with_name("spec")
                .required(true)
                .value_name("SPEC")
                .help("Aggregation spec, e.g. 'out=downcase(city),min(pop),count()'"),
        )
        .arg(
            Arg::with_name("file")
                .multiple(true)
                .value_name("FILE")
                .help("Input CSV files; read standard input when absent"),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .takes_value(true)
                .value_name("PATH")
                .help("Write the result here instead of standard output"),
        )
        .arg(
            Arg::with_name("line-max")
                .short("L")
                .takes_value(true)
                .value_name("BYTES")
                .help("Maximum line length in bytes [default: 65536]"),
        )
        .arg(
            Arg::with_name("merge")
                .short("m")
                .help("Inputs are partial outputs of earlier runs (map-reduce style)"),
        )
        .arg(
            Arg::with_name("scratch")
                .short("d")
                .takes_value(true)
                .value_name("DIR")
                .help("Directory for temporary swap files; should have lots of free space"),
        )
}

/// This function is the part of the program that directly interacts with
/// `main`.
pub fn run(config: CliConfig) -> CsvCliResult<()> {
    let plan = Plan::parse(&config.spec)?;
    let mut aggregator = Aggregator::new(plan, config.scratch.as_deref(), config.line_max)?;
    if config.files.is_empty() {
        if config.merge {
            aggregator.merge(None)?;
        } else {
            aggregator.aggregate(None)?;
        }
    } else {
        for file in &config.files {
            if config.merge {
                aggregator.merge(Some(file))?;
            } else {
                aggregator.aggregate(Some(file))?;
            }
        }
    }
    aggregator.write_results(config.output.as_deref())
}
