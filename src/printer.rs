//! Stack-trace formatting: turns resolved frames into human-readable text. The concrete
//! convenience sinks (write to a file, to a string, to several sinks at once) are callers'
//! business — this module only owns the formatting contract and the default one-line format.

use crate::symbol_engine::SymbolInfo;
use itertools::Itertools;
use std::io::{self, Write};

/// One resolved stack entry: position in the trace, raw frame address, and whatever the symbol
/// engine could recover for it (fields are independently optional — a stripped binary still
/// yields an entry, just a sparser one).
#[derive(Debug, Clone)]
pub struct StackEntry {
    pub frame_index: usize,
    pub frame_address: u64,
    pub symbol_info: SymbolInfo,
}

/// Extension point for callers who want a different rendering than the default one-liner.
pub trait Formatter {
    fn format_entry(&self, entry: &StackEntry) -> String;
}

/// `"<frame_index>#  <hex address>  <symbol_name>() [+byte_offset]  at <basename>:<line>
/// (<module_basename>)"`. Any field the symbol engine couldn't resolve is simply omitted, not
/// rendered as a placeholder.
pub struct DefaultFormatter;

impl Formatter for DefaultFormatter {
    fn format_entry(&self, entry: &StackEntry) -> String {
        let info = &entry.symbol_info;
        let mut line = format!("{}#  {:#018x}", entry.frame_index, entry.frame_address);

        if let Some(name) = &info.symbol_name {
            line.push_str(&format!("  {name}()"));
            if let Some(offset) = info.byte_offset {
                if offset != 0 {
                    line.push_str(&format!(" +{offset:#x}"));
                }
            }
        }

        if let Some(file) = &info.file {
            let basename = std::path::Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            line.push_str(&format!("  at {basename}"));
            if let Some(l) = info.line {
                line.push_str(&format!(":{l}"));
            }
        }

        if !info.module_name.is_empty() {
            line.push_str(&format!(" ({})", info.module_name));
        }

        line
    }
}

pub fn format_stack_trace(entries: &[StackEntry], formatter: &dyn Formatter) -> String {
    entries.iter().map(|e| formatter.format_entry(e)).join("\n")
}

/// Writes the formatted trace to any `io::Write` sink (a file, a `Vec<u8>` string buffer, a
/// socket) — the one mechanism every convenience printer in the source reduces to.
pub fn write_stack_trace<W: Write>(
    sink: &mut W,
    entries: &[StackEntry],
    formatter: &dyn Formatter,
) -> io::Result<()> {
    writeln!(sink, "{}", format_stack_trace(entries, formatter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(frame_index: usize, addr: u64, info: SymbolInfo) -> StackEntry {
        StackEntry {
            frame_index,
            frame_address: addr,
            symbol_info: info,
        }
    }

    #[test]
    fn default_format_includes_symbol_file_and_module() {
        let info = SymbolInfo {
            module_base: 0x400000,
            module_name: "app".into(),
            start_addr: Some(0x1020),
            byte_offset: Some(0x15),
            file: Some("/src/main.c".into()),
            line: Some(42),
            column: None,
            symbol_name: Some("foo".into()),
        };
        let formatted = DefaultFormatter.format_entry(&entry(0, 0x401035, info));
        assert!(formatted.starts_with("0#"));
        assert!(formatted.contains("foo()"));
        assert!(formatted.contains("+0x15"));
        assert!(formatted.contains("at main.c:42"));
        assert!(formatted.contains("(app)"));
    }

    #[test]
    fn default_format_degrades_gracefully_with_no_symbol() {
        let formatted = DefaultFormatter.format_entry(&entry(1, 0xdead, SymbolInfo::default()));
        assert!(formatted.starts_with("1#"));
        assert!(!formatted.contains("()"));
    }
}
