//! Reference dataset of municipalities and health regions
//!
//! Loaded once, before any lookup is dispatched, into an index keyed by
//! municipality code.

use cnes_common::types::ReferenceEntry;
use cnes_common::{CnesError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Key holding the entry list in the published dataset
pub const REFERENCE_LIST_KEY: &str = "macrorregiao_regiao_saude_municipios";

#[derive(Deserialize)]
#[serde(untagged)]
enum ReferenceDocument {
    Wrapped {
        #[serde(rename = "macrorregiao_regiao_saude_municipios")]
        entries: Vec<Value>,
    },
    List(Vec<Value>),
}

/// Reference entries by municipality code
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceIndex {
    entries: HashMap<String, ReferenceEntry>,
}

impl ReferenceIndex {
    /// Build an index; entries without a code are skipped and a repeated
    /// code keeps the last entry.
    pub fn from_entries(entries: impl IntoIterator<Item = ReferenceEntry>) -> Self {
        let mut index = HashMap::new();
        let mut skipped = 0usize;
        let mut replaced = 0usize;

        for entry in entries {
            if entry.municipality_code.is_empty() {
                skipped += 1;
                continue;
            }
            if index.insert(entry.municipality_code.clone(), entry).is_some() {
                replaced += 1;
            }
        }

        if skipped > 0 || replaced > 0 {
            debug!(skipped, replaced, "Reference entries skipped or replaced while indexing");
        }

        Self { entries: index }
    }

    pub fn get(&self, code: &str) -> Option<&ReferenceEntry> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a reference document already in memory.
pub fn parse_reference(content: &[u8]) -> Result<ReferenceIndex> {
    let document: ReferenceDocument = serde_json::from_slice(content).map_err(|e| {
        CnesError::reference_data(format!(
            "expected a list of municipalities or an object with '{}': {}",
            REFERENCE_LIST_KEY, e
        ))
    })?;

    let raw = match document {
        ReferenceDocument::Wrapped { entries } => entries,
        ReferenceDocument::List(entries) => entries,
    };

    let total = raw.len();
    let mut invalid = 0usize;
    let entries: Vec<ReferenceEntry> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                invalid += 1;
                debug!(error = %e, "Skipping malformed reference entry");
                None
            },
        })
        .collect();

    if invalid > 0 {
        warn!(invalid, total, "Some reference entries could not be parsed and were skipped");
    }

    Ok(ReferenceIndex::from_entries(entries))
}

/// Load the reference dataset from a JSON file.
pub fn load_reference(path: impl AsRef<Path>) -> Result<ReferenceIndex> {
    let path = path.as_ref();
    let content = std::fs::read(path).map_err(|e| {
        CnesError::reference_data(format!("cannot read '{}': {}", path.display(), e))
    })?;

    let index = parse_reference(&content).map_err(|e| match e {
        CnesError::ReferenceData(msg) => {
            CnesError::reference_data(format!("'{}': {}", path.display(), msg))
        },
        other => other,
    })?;

    if index.is_empty() {
        warn!(path = %path.display(), "Reference dataset has no usable entries; no record will be enriched");
    } else {
        info!(path = %path.display(), municipalities = index.len(), "Reference dataset loaded");
    }

    Ok(index)
}
