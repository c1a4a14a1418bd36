//! Section directory: name-keyed, lazily materialized byte ranges within an image file.

use std::collections::HashMap;
use std::sync::Arc;

/// A single section's location within the image file, with its bytes materialized on first use.
///
/// Materialized bytes are held behind an `Arc<[u8]>` rather than a plain `Vec<u8>`: the DWARF
/// resolver built on top of `.debug_*` sections needs a `'static`, thread-shareable owner for its
/// `gimli` reader, and cloning the `Arc` is the cheap way to hand it that without duplicating the
/// bytes or entangling the resolver's lifetime with the image reader's.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub file_offset: u64,
    pub size: u64,
    data: Option<Arc<[u8]>>,
}

impl Section {
    pub fn new(name: impl Into<String>, file_offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            file_offset,
            size,
            data: None,
        }
    }

    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            name: name.into(),
            file_offset: 0,
            size,
            data: Some(Arc::from(data)),
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.data.is_some()
    }

    pub fn materialize(&mut self, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len() as u64, self.size);
        self.data = Some(Arc::from(bytes));
    }

    /// Bytes of the section, if already materialized.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// A cheap, ref-counted handle to the materialized bytes, for owners (like the DWARF
    /// resolver) that must outlive this section's image reader.
    pub fn data_arc(&self) -> Option<Arc<[u8]>> {
        self.data.clone()
    }
}

/// Name-keyed directory of a module's sections, populated while the section-header table is
/// walked and filled in lazily as sections are materialized.
#[derive(Debug, Default)]
pub struct SectionDirectory {
    sections: HashMap<String, Section>,
    order: Vec<String>,
}

impl SectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, section: Section) {
        if !self.sections.contains_key(&section.name) {
            self.order.push(section.name.clone());
        }
        self.sections.insert(section.name.clone(), section);
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections.get_mut(name)
    }

    pub fn for_each(&self, prefix: &str, mut visitor: impl FnMut(&Section)) {
        for name in &self.order {
            if name.starts_with(prefix) {
                visitor(&self.sections[name]);
            }
        }
    }
}
