//! Joining looked-up records with the reference dataset
//!
//! The merge is a pure function of the records and the index: a missing
//! reference entry is counted, never an error.

use crate::reference::ReferenceIndex;
use cnes_common::types::{Attributes, Record, RegionFields};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A record as written to the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    /// Attributes returned by the lookup service
    #[serde(flatten)]
    pub attributes: Attributes,

    /// Reference fields; absent when the join missed
    #[serde(
        rename = "dados_macrorregiao",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub region: Option<RegionFields>,
}

impl EnrichedRecord {
    pub fn is_enriched(&self) -> bool {
        self.region.is_some()
    }
}

/// Join statistics, tracked apart from lookup failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub total: usize,
    pub matched: usize,
    pub missed: usize,

    /// Codes that had no reference entry, in record order
    pub missing_codes: Vec<String>,
}

impl MergeStats {
    /// Matched share in percent; 0 for an empty merge
    pub fn match_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.matched as f64 / self.total as f64 * 100.0
        }
    }
}

/// Result of merging a batch of records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub records: Vec<EnrichedRecord>,
    pub stats: MergeStats,
}

/// Attaches reference fields to records by an exact code match
pub struct Enricher<'a> {
    index: &'a ReferenceIndex,
    join_field: &'a str,
}

impl<'a> Enricher<'a> {
    pub fn new(index: &'a ReferenceIndex, join_field: &'a str) -> Self {
        Self { index, join_field }
    }

    /// Enrich one record. Returns the output record and, on a miss, the
    /// code that was not found (if the record had one).
    pub fn enrich(&self, record: &Record) -> (EnrichedRecord, Option<String>) {
        let code = record.code(self.join_field);
        let region = code
            .as_deref()
            .and_then(|code| self.index.get(code))
            .map(|entry| entry.region.clone());

        let missing = if region.is_none() { code } else { None };
        let enriched = EnrichedRecord {
            attributes: record.attributes.clone(),
            region,
        };
        (enriched, missing)
    }

    pub fn merge(&self, records: &[Record]) -> Enrichment {
        let mut stats = MergeStats {
            total: records.len(),
            ..MergeStats::default()
        };

        let records = records
            .iter()
            .map(|record| {
                let (enriched, missing) = self.enrich(record);
                if enriched.is_enriched() {
                    stats.matched += 1;
                } else {
                    stats.missed += 1;
                    debug!(
                        identifier = %record.metadata.identifier,
                        code = missing.as_deref().unwrap_or(""),
                        "No reference entry for record"
                    );
                    stats.missing_codes.extend(missing);
                }
                enriched
            })
            .collect();

        Enrichment { records, stats }
    }
}
