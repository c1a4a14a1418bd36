//! Enumerates life-sign segments left behind on the disk-backed platform: any file under
//! `/dev/shm` whose name matches the pattern `shm::segment_name` produces, regardless of whether
//! its creator process is still alive.

use crate::error::Result;
use crate::lifesign::shm::SHM_DIRECTORY;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;

static SEGMENT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dbgutil\.life-sign\..*\.shm$").expect("static regex is valid"));

#[derive(Debug, Clone)]
pub struct DiscoveredSegment {
    pub name: String,
    pub size_bytes: u64,
}

pub fn enumerate() -> Result<Vec<DiscoveredSegment>> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(SHM_DIRECTORY) {
        Ok(entries) => entries,
        Err(_) => return Ok(found),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !SEGMENT_NAME_RE.is_match(&name) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        found.push(DiscoveredSegment {
            name,
            size_bytes: metadata.len(),
        });
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_regex_matches_expected_shape() {
        assert!(SEGMENT_NAME_RE.is_match("dbgutil.life-sign.myapp.2024-01-15_10-30-00.4242.shm"));
        assert!(SEGMENT_NAME_RE.is_match("dbgutil.life-sign.myapp.shm"));
        assert!(!SEGMENT_NAME_RE.is_match("unrelated.shm"));
    }
}
