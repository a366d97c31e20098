//! This module compiles the aggregation spec you type on the command line
//! into a [`Plan`] the engine can run.
//!
//! A spec is a comma-separated list of items like
//! `outname1=downcase(col1),min(col2),count()`. Each item names an
//! aggregator and, usually, the input column it reads. A bare column name is
//! shorthand for `str(name)`, so `city,count()` groups by `city` verbatim.
//! The optional `outname=` prefix renames the output column; without it the
//! output column is named by the item's own text.
//!
//! Commas only separate items at parenthesis depth zero, so a future
//! aggregator taking several arguments will not need a grammar change.
//! Whitespace is skipped until a token begins; once one has begun, interior
//! whitespace belongs to the token, which keeps column names with spaces in
//! them working without any quoting rules.

use once_cell::sync::Lazy;

use crate::aggfunc::AggFunc;
use crate::errors::{CsvCliError, CsvCliResult};

static AGG_NAMES: Lazy<String> = Lazy::new(|| {
    AggFunc::ALL
        .iter()
        .map(|f| f.name())
        .collect::<Vec<_>>()
        .join(", ")
});

/// One output column of the final CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    /// The name written in the output header row.
    pub name: String,
    /// The input column this aggregator reads, if it reads one. `count()`
    /// has no input, so this is `None` there.
    pub input: Option<String>,
    /// This column's position in the plan, and therefore the index of its
    /// cell inside every group's accumulator tuple.
    pub slot: usize,
    /// The aggregation function bound to the column.
    pub func: AggFunc,
}

/// The parsed aggregation spec: an ordered list of output columns. A plan is
/// immutable once parsed; anything that varies per input file (like resolved
/// header indexes) lives with the engine instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    columns: Vec<OutputColumn>,
}

impl Plan {
    /// Compiles `spec` into a plan, or explains why it cannot be one.
    pub fn parse(spec: &str) -> CsvCliResult<Plan> {
        let mut columns: Vec<OutputColumn> = Vec::new();
        let mut outname = String::new();
        let mut token = String::new();
        let mut pending: Option<AggFunc> = None;
        let mut parens = 0i32;
        let mut item_start = 0usize;

        let push_bare = |columns: &mut Vec<OutputColumn>,
                             token: &mut String,
                             outname: &mut String,
                             default_name: &str| {
            let name = if outname.is_empty() {
                default_name.to_string()
            } else {
                std::mem::take(outname)
            };
            columns.push(OutputColumn {
                name,
                input: Some(std::mem::take(token)),
                slot: columns.len(),
                func: AggFunc::Str,
            });
        };

        for (i, c) in spec.char_indices() {
            if c == '=' && parens == 0 {
                outname = std::mem::take(&mut token);
            } else if c == '(' {
                parens += 1;
                if parens == 1 {
                    let func = AggFunc::from_name(&token).ok_or_else(|| {
                        CsvCliError::InvalidSpec(format!(
                            "unknown aggregator `{}` (expected one of: {})",
                            token, *AGG_NAMES
                        ))
                    })?;
                    pending = Some(func);
                    token.clear();
                }
            } else if c == ')' {
                parens -= 1;
                if parens == 0 {
                    if let Some(func) = pending.take() {
                        let name = if outname.is_empty() {
                            spec[item_start..=i].to_string()
                        } else {
                            std::mem::take(&mut outname)
                        };
                        let input = if token.is_empty() {
                            None
                        } else {
                            Some(std::mem::take(&mut token))
                        };
                        columns.push(OutputColumn {
                            name,
                            input,
                            slot: columns.len(),
                            func,
                        });
                    }
                    token.clear();
                }
            } else if c == ',' && parens == 0 {
                if !token.is_empty() {
                    push_bare(&mut columns, &mut token, &mut outname, &spec[item_start..i]);
                }
                item_start = i + 1;
            } else if c != ' ' || !token.is_empty() {
                token.push(c);
            }
        }

        if parens == 0 && !token.is_empty() {
            push_bare(&mut columns, &mut token, &mut outname, &spec[item_start..]);
        }

        if parens != 0 {
            return Err(CsvCliError::InvalidSpec(format!(
                "unmatched parenthesis (depth {} at end of spec)",
                parens
            )));
        }
        if columns.is_empty() {
            return Err(CsvCliError::InvalidSpec("empty spec".to_string()));
        }

        Ok(Plan { columns })
    }

    pub fn columns(&self) -> &[OutputColumn] {
        &self.columns
    }

    /// The number of output columns, which is also the width of every
    /// group's accumulator tuple.
    pub fn width(&self) -> usize {
        self.columns.len()
    }
}
