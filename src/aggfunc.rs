//! The `aggfunc` module is the central module for computing aggregates from a
//! stream of records.
//!
//! Every output column of a run is bound to one [`AggFunc`]. An `AggFunc` is
//! either a *key* function (`str`, `downcase`), which normalizes a field's
//! bytes so the field can take part in the group-by key, or a *value*
//! function (everything else), which folds one field per accepted row into an
//! accumulator [`Cell`]. Value functions also know how to `merge` a field
//! that came out of a previous run's output, which is what makes map-reduce
//! style batching work, and how to `emit` their final cell as CSV.
//!
//! Fields arrive as raw byte slices and stay bytes all the way through: the
//! accumulators never decode them, so CSV content that is not valid UTF-8
//! passes through untouched and comparisons are plain byte comparisons.
//!
//! The set of aggregators is closed on purpose: the engine dispatches on the
//! variant and never needs to know what lives inside a cell, while adding an
//! aggregator stays a local change to this file.

use std::io;
use std::mem;

use indexmap::IndexSet;

use crate::arena::{KeyArena, KeyRef};
use crate::output::OutputSink;

/// The most values a `top20` cell will collect.
const TOP_LIMIT: usize = 20;

/// One accumulator slot inside a group's value tuple.
///
/// Which variant a given slot holds is fixed by the aggregator bound to that
/// slot in the plan; `Empty` is the zero state every slot starts in before
/// its first touch, and the state an owned cell returns to after emission.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    /// Running integer state for `count`, `min`, and `max`.
    Int(i64),
    /// Owned byte-string state for `minstr` and `maxstr`.
    Str(Vec<u8>),
    /// Insertion-ordered unique byte strings for `top20`.
    List(IndexSet<Vec<u8>>),
    /// The group's normalized key bytes, stored in the arena.
    Key(KeyRef),
}

/// A named aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Str,
    Downcase,
    Top20,
    Min,
    Max,
    MinStr,
    MaxStr,
    Count,
}

impl AggFunc {
    /// Every aggregator, in the order they appear in the usage text.
    pub const ALL: [AggFunc; 8] = [
        AggFunc::Str,
        AggFunc::Downcase,
        AggFunc::Top20,
        AggFunc::Min,
        AggFunc::Max,
        AggFunc::MinStr,
        AggFunc::MaxStr,
        AggFunc::Count,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Str => "str",
            AggFunc::Downcase => "downcase",
            AggFunc::Top20 => "top20",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::MinStr => "minstr",
            AggFunc::MaxStr => "maxstr",
            AggFunc::Count => "count",
        }
    }

    /// Looks an aggregator up by the name used in the spec string.
    pub fn from_name(name: &str) -> Option<AggFunc> {
        AggFunc::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Key functions contribute to the group-by key; value functions
    /// contribute an accumulator slot.
    pub fn is_key(self) -> bool {
        matches!(self, AggFunc::Str | AggFunc::Downcase)
    }

    /// Normalizes raw key bytes in place. A no-op for `str`; `downcase`
    /// lower-cases ASCII letters the way the grouping is documented to.
    pub fn normalize_key(self, field: &mut Vec<u8>) {
        if let AggFunc::Downcase = self {
            field.make_ascii_lowercase();
        }
    }

    /// Folds one fresh input field into the cell. `field` is `None` for
    /// aggregators bound to no input column (`count()`); `first` is true the
    /// first time this group's tuple is touched.
    pub fn step(self, cell: &mut Cell, field: Option<&[u8]>, first: bool) {
        match self {
            AggFunc::Str | AggFunc::Downcase => {}
            AggFunc::Top20 => push_top(cell, field.unwrap_or(b""), first),
            AggFunc::Min => {
                let val = parse_auto_int(field.unwrap_or(b""));
                match cell {
                    Cell::Int(cur) if !first => {
                        if val < *cur {
                            *cur = val;
                        }
                    }
                    _ => *cell = Cell::Int(val),
                }
            }
            AggFunc::Max => {
                let val = parse_auto_int(field.unwrap_or(b""));
                match cell {
                    Cell::Int(cur) if !first => {
                        if val > *cur {
                            *cur = val;
                        }
                    }
                    _ => *cell = Cell::Int(val),
                }
            }
            AggFunc::MinStr => {
                let val = field.unwrap_or(b"");
                match cell {
                    Cell::Str(cur) if !first => {
                        if val < cur.as_slice() {
                            *cur = val.to_vec();
                        }
                    }
                    _ => *cell = Cell::Str(val.to_vec()),
                }
            }
            AggFunc::MaxStr => {
                let val = field.unwrap_or(b"");
                match cell {
                    Cell::Str(cur) if !first => {
                        if val > cur.as_slice() {
                            *cur = val.to_vec();
                        }
                    }
                    _ => *cell = Cell::Str(val.to_vec()),
                }
            }
            AggFunc::Count => match cell {
                Cell::Int(n) if !first => *n += 1,
                _ => *cell = Cell::Int(1),
            },
        }
    }

    /// Folds one field of a previous run's output into the cell. For most
    /// value functions this is the same fold as [`AggFunc::step`]; `count`
    /// adds the stored tally instead of bumping by one, and `top20` splits
    /// the joined list back apart first.
    pub fn merge(self, cell: &mut Cell, field: &[u8], first: bool) {
        match self {
            AggFunc::Str | AggFunc::Downcase => {}
            AggFunc::Top20 => {
                let mut first = first;
                for tok in field.split(|&b| b == b',') {
                    push_top(cell, tok, first);
                    first = false;
                }
            }
            AggFunc::Min | AggFunc::Max | AggFunc::MinStr | AggFunc::MaxStr => {
                self.step(cell, Some(field), first)
            }
            AggFunc::Count => {
                if first {
                    *cell = Cell::Int(0);
                }
                if let Cell::Int(n) = cell {
                    *n = n.saturating_add(parse_auto_int(field));
                }
            }
        }
    }

    /// Writes the cell's final value as one CSV field and releases any owned
    /// storage, leaving the cell `Empty`.
    pub fn emit(
        self,
        cell: &mut Cell,
        arena: &KeyArena,
        out: &mut OutputSink,
    ) -> io::Result<()> {
        match (self, mem::replace(cell, Cell::Empty)) {
            (AggFunc::Str, Cell::Key(key)) | (AggFunc::Downcase, Cell::Key(key)) => {
                out.field_quoted(arena.get(key))
            }
            (AggFunc::Top20, Cell::List(vals)) => {
                let mut joined = Vec::new();
                for (i, val) in vals.iter().enumerate() {
                    if i > 0 {
                        joined.push(b',');
                    }
                    joined.extend_from_slice(val);
                }
                out.field_quoted(&joined)
            }
            (AggFunc::MinStr, Cell::Str(val)) | (AggFunc::MaxStr, Cell::Str(val)) => {
                out.field_quoted(&val)
            }
            (AggFunc::Min, Cell::Int(val))
            | (AggFunc::Max, Cell::Int(val))
            | (AggFunc::Count, Cell::Int(val)) => out.field_int(val),
            // A slot this aggregator never touched, possible only for an
            // input that produced the group without feeding this column.
            (AggFunc::Min, _) | (AggFunc::Max, _) | (AggFunc::Count, _) => out.field_int(0),
            (_, _) => out.field_quoted(b""),
        }
    }
}

fn push_top(cell: &mut Cell, field: &[u8], first: bool) {
    if first || !matches!(cell, Cell::List(_)) {
        *cell = Cell::List(IndexSet::new());
    }
    if let Cell::List(vals) = cell {
        if vals.len() < TOP_LIMIT {
            vals.insert(field.to_vec());
        }
    }
}

/// Parses a signed 64-bit integer the way `strtoll(s, NULL, 0)` does: leading
/// whitespace skipped, `0x`/`0X` hex, a leading `0` octal, decimal otherwise,
/// reading the longest valid prefix and yielding 0 when there is none.
/// Out-of-range values saturate at the i64 bounds.
pub fn parse_auto_int(field: &[u8]) -> i64 {
    let mut bytes = field;
    while let Some((&first, rest)) = bytes.split_first() {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    let mut i = 0;
    let mut negative = false;
    match bytes.first() {
        Some(&b'+') => i = 1,
        Some(&b'-') => {
            negative = true;
            i = 1;
        }
        _ => {}
    }
    let mut radix = 10;
    if bytes.get(i) == Some(&b'0') {
        let hex_marker = matches!(bytes.get(i + 1), Some(&b'x') | Some(&b'X'));
        if hex_marker && bytes.get(i + 2).map_or(false, |b| (*b as char).is_digit(16)) {
            radix = 16;
            i += 2;
        } else {
            radix = 8;
        }
    }
    let mut acc: i64 = 0;
    let mut seen_digit = false;
    while let Some(d) = bytes.get(i).and_then(|b| (*b as char).to_digit(radix)) {
        seen_digit = true;
        i += 1;
        acc = match acc
            .checked_mul(i64::from(radix))
            .and_then(|v| v.checked_add(i64::from(d)))
        {
            Some(v) => v,
            None => return if negative { i64::MIN } else { i64::MAX },
        };
    }
    if !seen_digit {
        return 0;
    }
    if negative {
        -acc
    } else {
        acc
    }
}
