//! DWARF line-number program: executes the opcode stream (via `gimli`'s state machine, which
//! implements exactly the DW_LNS/DW_LNE dispatch this module's header documents) to produce a
//! sorted `(address, file_index, line, column)` matrix, then offers the stable lower-bound
//! lookup the symbol engine queries.

use super::cu::CuSummary;
use super::R;
use crate::error::{Error, Result};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct LineRow {
    pub address: u64,
    pub file_index: u64,
    pub line: u64,
    pub column: u64,
    pub is_stmt: bool,
}

pub struct LineMatrix {
    rows: Vec<LineRow>,
    files: Vec<PathBuf>,
    /// Index into `files` of the compilation unit's own source file (its `DW_AT_name`), when one
    /// of the line program's file entries matches it. Used to break ties among rows that share an
    /// address: a PC can land exactly on an address claimed by both the CU's own code and an
    /// inlined STL/libstdc++ header row, and the primary file should win.
    primary_file_index: Option<u64>,
}

impl LineMatrix {
    /// Lower-bounds by address; on an exact tie, among the run of rows sharing that address, the
    /// one attributed to the compilation unit's primary file wins over one from another header,
    /// falling back to the first row emitted by the line program (the build step is a stable
    /// sort). A miss on the landing row steps back to the previous address group before giving
    /// up, per the search algorithm's two-phase check.
    pub fn lookup(&self, relocated_address: u64) -> Result<&LineRow> {
        let idx = self
            .rows
            .partition_point(|r| r.address < relocated_address);

        if idx < self.rows.len() && self.rows[idx].address == relocated_address {
            return Ok(self.select_preferred(idx));
        }
        if idx == 0 {
            return Err(Error::NotFound);
        }
        let candidate = &self.rows[idx - 1];
        if candidate.address <= relocated_address {
            Ok(self.select_preferred(idx - 1))
        } else {
            Err(Error::NotFound)
        }
    }

    /// Returns the `[lo, hi]` index range of rows sharing `self.rows[idx].address`.
    fn group_bounds(&self, idx: usize) -> (usize, usize) {
        let addr = self.rows[idx].address;
        let mut lo = idx;
        while lo > 0 && self.rows[lo - 1].address == addr {
            lo -= 1;
        }
        let mut hi = idx;
        while hi + 1 < self.rows.len() && self.rows[hi + 1].address == addr {
            hi += 1;
        }
        (lo, hi)
    }

    fn select_preferred(&self, idx: usize) -> &LineRow {
        let (lo, hi) = self.group_bounds(idx);
        if let Some(primary) = self.primary_file_index {
            if let Some(row) = self.rows[lo..=hi].iter().find(|r| r.file_index == primary) {
                return row;
            }
        }
        &self.rows[lo]
    }

    pub fn file(&self, index: u64) -> Option<&PathBuf> {
        self.files.get(index as usize)
    }
}

/// True when `file`'s basename matches `primary`'s basename — the CU's `DW_AT_name` and the
/// matching file-table entry don't always agree on directory prefix, but the compiler always
/// emits the same leaf name for both.
fn is_primary_file(file: &std::path::Path, primary: &str) -> bool {
    let primary_name = std::path::Path::new(primary).file_name();
    file.file_name().is_some() && file.file_name() == primary_name
}

pub fn build(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    summary: &CuSummary,
) -> Result<LineMatrix> {
    let _ = summary.line_program_offset.ok_or(Error::NotFound)?;
    let program = unit.line_program.clone().ok_or(Error::NotFound)?;

    let mut rows = program.rows();
    let mut matrix = Vec::new();
    while let Some((_, row)) = rows.next_row().map_err(Error::DwarfParsing)? {
        let column = match row.column() {
            gimli::ColumnType::LeftEdge => 0,
            gimli::ColumnType::Column(c) => c.get(),
        };
        let line = row.line().map(|l| l.get()).unwrap_or(0);
        matrix.push(LineRow {
            address: row.address(),
            file_index: row.file_index(),
            line,
            column,
            is_stmt: row.is_stmt(),
        });
    }
    // `next_row` already emits in program order; the design's "stable sort by address" is
    // satisfied by a stable sort here in case the header declares `opcode_base` such that rows
    // arrive out of address order across DW_LNE_set_address jumps.
    matrix.sort_by_key(|r| r.address);

    let header = rows.header();
    let mut files = Vec::new();
    let mut index = 0u64;
    while let Some(file) = header.file(index) {
        let name = dwarf
            .attr_string(unit, file.path_name())
            .ok()
            .map(|s| PathBuf::from(s.to_string_lossy().into_owned()))
            .unwrap_or_default();
        files.push(name);
        index += 1;
    }

    let primary_file_index = summary.name.as_deref().and_then(|primary| {
        files
            .iter()
            .position(|f| is_primary_file(f, primary))
            .map(|i| i as u64)
    });

    Ok(LineMatrix {
        rows: matrix,
        files,
        primary_file_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(address: u64, file_index: u64, line: u64) -> LineRow {
        LineRow {
            address,
            file_index,
            line,
            column: 0,
            is_stmt: true,
        }
    }

    #[test]
    fn lookup_prefers_primary_file_on_address_tie() {
        // Two rows share address 0x1000: one attributed to the CU's own file (index 0), one to
        // an inlined STL header (index 1) that the line program happened to emit first.
        let matrix = LineMatrix {
            rows: vec![row(0x1000, 1, 55), row(0x1000, 0, 12)],
            files: vec![PathBuf::from("/src/main.cpp"), PathBuf::from("/usr/include/c++/vector")],
            primary_file_index: Some(0),
        };
        let found = matrix.lookup(0x1000).unwrap();
        assert_eq!(found.file_index, 0);
        assert_eq!(found.line, 12);
    }

    #[test]
    fn lookup_falls_back_to_program_order_without_a_primary_match() {
        let matrix = LineMatrix {
            rows: vec![row(0x1000, 1, 55), row(0x1000, 2, 12)],
            files: vec![PathBuf::from("/src/main.cpp"), PathBuf::from("/usr/include/c++/vector")],
            primary_file_index: None,
        };
        let found = matrix.lookup(0x1000).unwrap();
        assert_eq!(found.line, 55);
    }

    #[test]
    fn lookup_steps_back_to_previous_row_group() {
        let matrix = LineMatrix {
            rows: vec![row(0x1000, 0, 10), row(0x2000, 0, 20)],
            files: vec![PathBuf::from("/src/main.cpp")],
            primary_file_index: Some(0),
        };
        let found = matrix.lookup(0x1500).unwrap();
        assert_eq!(found.line, 10);
        assert!(matrix.lookup(0x500).is_err());
    }
}
