//! Loading the identifiers to look up
//!
//! Accepted JSON shapes:
//! - `["2077485", 2077493, {"codigo_cnes": "2077507"}]`
//! - `{"estabelecimentos": [{"codigo_cnes": ...}, ...]}`
//! - `{"codigo_cnes": ...}`
//! - `{"codigos": [...]}`
//!
//! Input order is kept and duplicates are not removed.

use cnes_common::types::{value_to_code, Identifier};
use cnes_common::{CnesError, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Attribute naming the establishment code in object entries
pub const IDENTIFIER_KEY: &str = "codigo_cnes";

/// Extract identifiers from a parsed document.
pub fn parse_identifiers(document: &Value) -> Result<Vec<Identifier>> {
    let codes: Vec<Option<String>> = match document {
        Value::Array(items) => items.iter().map(item_code).collect(),
        Value::Object(map) => {
            if let Some(list) = map.get("estabelecimentos") {
                let Value::Array(items) = list else {
                    return Err(CnesError::invalid_input("'estabelecimentos' must be a list"));
                };
                items
                    .iter()
                    .map(|item| item.get(IDENTIFIER_KEY).and_then(value_to_code))
                    .collect()
            } else if let Some(code) = map.get(IDENTIFIER_KEY) {
                vec![value_to_code(code)]
            } else if let Some(list) = map.get("codigos") {
                let Value::Array(items) = list else {
                    return Err(CnesError::invalid_input("'codigos' must be a list"));
                };
                items.iter().map(value_to_code).collect()
            } else {
                return Err(CnesError::invalid_input(format!(
                    "object has none of 'estabelecimentos', '{}' or 'codigos'",
                    IDENTIFIER_KEY
                )));
            }
        },
        _ => {
            return Err(CnesError::invalid_input(
                "expected a list of codes or an object holding them",
            ))
        },
    };

    let found = codes.len();
    let identifiers: Vec<Identifier> = codes.into_iter().flatten().map(Identifier::new).collect();

    let skipped = found - identifiers.len();
    if skipped > 0 {
        warn!(skipped, "Ignoring entries without a usable code");
    }

    if identifiers.is_empty() {
        return Err(CnesError::invalid_input("no valid CNES code found"));
    }

    Ok(identifiers)
}

fn item_code(item: &Value) -> Option<String> {
    match item {
        Value::Object(map) => map.get(IDENTIFIER_KEY).and_then(value_to_code),
        other => value_to_code(other),
    }
}

/// Number of entries repeating an earlier identifier
pub fn count_duplicates(identifiers: &[Identifier]) -> usize {
    let mut seen = HashSet::with_capacity(identifiers.len());
    identifiers.iter().filter(|id| !seen.insert(id.as_str())).count()
}

/// Read identifiers from a JSON file.
pub fn load_identifiers(path: impl AsRef<Path>) -> Result<Vec<Identifier>> {
    let path = path.as_ref();
    let content = std::fs::read(path)
        .map_err(|e| CnesError::invalid_input(format!("cannot read '{}': {}", path.display(), e)))?;
    let document: Value = serde_json::from_slice(&content).map_err(|e| {
        CnesError::invalid_input(format!("'{}' is not valid JSON: {}", path.display(), e))
    })?;

    let identifiers = parse_identifiers(&document).map_err(|e| match e {
        CnesError::InvalidInput(msg) => {
            CnesError::invalid_input(format!("'{}': {}", path.display(), msg))
        },
        other => other,
    })?;

    let duplicates = count_duplicates(&identifiers);
    if duplicates > 0 {
        warn!(
            duplicates,
            "Input repeats some codes; every occurrence is looked up"
        );
    }

    info!(path = %path.display(), identifiers = identifiers.len(), "Loaded CNES codes");
    Ok(identifiers)
}
