//! Pipeline identity derivation
//!
//! Pipeline, dataset and table names are a pure function of the canonical
//! request. The disambiguating suffix is the first 64 bits of a SHA-256 over
//! the canonical key, so for `n` distinct sources the chance of any two
//! sharing a dataset name is about `n^2 / 2^65` (roughly 3e-8 at a million
//! pipelines).

use crate::connectors::formats::file_stem;
use crate::connectors::{ExtractionRequest, SourceKind, SourceUnit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sha2::{Digest, Sha256};
use url::Url;

/// Postgres truncates identifiers beyond this many bytes
const MAX_IDENTIFIER_LEN: usize = 63;
const SUFFIX_BYTES: usize = 8;
const UNIT_SUFFIX_BYTES: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineIdentity {
    pub pipeline_name: String,
    pub dataset_name: String,
    pub table_name: String,
    /// True when the table name came from an explicit override
    pub table_overridden: bool,
}

impl PipelineIdentity {
    /// Destination table for one unit of the source. An override sends every
    /// unit into the same table; otherwise each unit gets its own table.
    pub fn table_for(&self, unit: &SourceUnit) -> String {
        if self.table_overridden {
            self.table_name.clone()
        } else {
            sanitize_table_name(&unit.name)
        }
    }

    /// Destination table of every unit, in input order. Units whose names
    /// sanitize to the same table (`a.csv` and `a.json`, `sub/a.csv` and
    /// `a.csv`) only share it under an override; otherwise the lowest locator
    /// keeps the plain name and the others get a suffix hashed from their
    /// locator.
    pub fn tables_for(&self, units: &[SourceUnit]) -> Vec<String> {
        let names: Vec<String> = units.iter().map(|u| self.table_for(u)).collect();
        if self.table_overridden {
            return names;
        }

        let mut owner: HashMap<&str, &str> = HashMap::new();
        for (unit, name) in units.iter().zip(&names) {
            owner
                .entry(name.as_str())
                .and_modify(|locator| {
                    if unit.locator.as_str() < *locator {
                        *locator = unit.locator.as_str();
                    }
                })
                .or_insert(unit.locator.as_str());
        }

        units
            .iter()
            .zip(&names)
            .map(|(unit, name)| {
                if owner.get(name.as_str()) == Some(&unit.locator.as_str()) {
                    name.clone()
                } else {
                    let suffix = hex_digest(&unit.locator, UNIT_SUFFIX_BYTES);
                    truncate_identifier(&format!("{}_{}", name, suffix), &suffix)
                }
            })
            .collect()
    }
}

fn hex_digest(input: &str, bytes: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..bytes].iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct PipelineIdentityResolver;

impl PipelineIdentityResolver {
    pub fn resolve(request: &ExtractionRequest) -> PipelineIdentity {
        let key = Self::canonical_key(request);
        let suffix = Self::suffix(&key);
        let source_name = Self::source_name(request);

        let dataset_name = match &request.requested_dataset {
            Some(dataset) => sanitize_table_name(dataset),
            None => format!("{}_{}", request.source_kind, suffix),
        };

        let (table_name, table_overridden) = match &request.requested_destination_table {
            Some(table) => (sanitize_table_name(table), true),
            None => (sanitize_table_name(&source_name), false),
        };

        let pipeline_name = truncate_identifier(&format!(
            "datalumos_{}_{}_{}",
            request.source_kind,
            sanitize_table_name(&source_name),
            suffix
        ), &suffix);

        PipelineIdentity {
            pipeline_name,
            dataset_name,
            table_name,
            table_overridden,
        }
    }

    /// Newline-joined canonical fields. Overrides participate so that an
    /// override used once and then dropped counts as a different run.
    pub fn canonical_key(request: &ExtractionRequest) -> String {
        [
            request.source_kind.as_str().to_string(),
            Self::redacted_location(request),
            request.selector.canonical_key(),
            format!(
                "table={}",
                request.requested_destination_table.as_deref().unwrap_or("")
            ),
            format!("dataset={}", request.requested_dataset.as_deref().unwrap_or("")),
        ]
        .join("\n")
    }

    /// Location with any embedded password removed, so rotating a secret
    /// does not move the destination.
    pub fn redacted_location(request: &ExtractionRequest) -> String {
        match request.source_kind {
            SourceKind::Relational => match Url::parse(&request.location) {
                Ok(mut url) if url.password().is_some() => {
                    let _ = url.set_password(None);
                    url.to_string()
                }
                _ => request.location.clone(),
            },
            _ => request.location.clone(),
        }
    }

    fn suffix(key: &str) -> String {
        hex_digest(key, SUFFIX_BYTES)
    }

    /// Human-meaningful part of the location: database name, bucket, or the
    /// last path component without its extension.
    fn source_name(request: &ExtractionRequest) -> String {
        match request.source_kind {
            SourceKind::Relational => Url::parse(&request.location)
                .ok()
                .and_then(|url| {
                    url.path_segments()
                        .and_then(|mut segments| segments.next_back().map(str::to_string))
                })
                .filter(|db| !db.is_empty())
                .map(|db| file_stem(&db))
                .unwrap_or_else(|| "database".to_string()),
            SourceKind::ObjectStore => Url::parse(&request.location)
                .ok()
                .and_then(|url| {
                    let last = url
                        .path_segments()
                        .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string));
                    last.or_else(|| url.host_str().map(str::to_string))
                })
                .map(|name| file_stem(&name))
                .unwrap_or_else(|| "bucket".to_string()),
            SourceKind::Filesystem => {
                let last = request
                    .location
                    .rsplit(['/', '\\'])
                    .find(|s| !s.is_empty())
                    .unwrap_or("data");
                file_stem(last)
            }
        }
    }
}

/// Lowercase `[a-z0-9_]`, never starting with a digit, never empty, at most
/// 63 bytes.
pub fn sanitize_table_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    let sanitized = if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        format!("t_{}", sanitized)
    } else {
        sanitized
    };

    if sanitized.is_empty() {
        return "unknown_table".to_string();
    }

    sanitized.chars().take(MAX_IDENTIFIER_LEN).collect()
}

/// Shorten the middle of a name so the hash suffix always survives.
fn truncate_identifier(name: &str, suffix: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name.to_string();
    }
    let keep = MAX_IDENTIFIER_LEN - suffix.len() - 1;
    format!("{}_{}", &name[..keep], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::normalizer::{RawSourceConfig, SourceConfigNormalizer};

    fn fs_request(path: &str, table: Option<&str>) -> ExtractionRequest {
        let raw = RawSourceConfig {
            path: Some(path.to_string()),
            table_name: table.map(str::to_string),
            ..Default::default()
        };
        SourceConfigNormalizer::normalize(&raw, SourceKind::Filesystem).unwrap()
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let request = fs_request("/data/exports/states.csv", None);
        assert_eq!(
            PipelineIdentityResolver::resolve(&request),
            PipelineIdentityResolver::resolve(&request)
        );
    }

    #[test]
    fn test_distinct_locations_get_distinct_datasets() {
        let a = PipelineIdentityResolver::resolve(&fs_request("/data/a", None));
        let b = PipelineIdentityResolver::resolve(&fs_request("/data/b", None));
        assert_ne!(a.dataset_name, b.dataset_name);
        assert!(a.dataset_name.starts_with("filesystem_"));
        assert_eq!(a.dataset_name.len(), "filesystem_".len() + 16);
    }

    #[test]
    fn test_trailing_separator_does_not_change_identity() {
        let a = PipelineIdentityResolver::resolve(&fs_request("/data/a/", None));
        let b = PipelineIdentityResolver::resolve(&fs_request("/data/a", None));
        assert_eq!(a, b);
    }

    #[test]
    fn test_override_participates_in_identity() {
        let plain = PipelineIdentityResolver::resolve(&fs_request("/data/a.csv", None));
        let first = PipelineIdentityResolver::resolve(&fs_request("/data/a.csv", Some("Sales 2024")));
        let again = PipelineIdentityResolver::resolve(&fs_request("/data/a.csv", Some("Sales 2024")));

        assert_eq!(first, again);
        assert_eq!(first.table_name, "sales_2024");
        assert!(first.table_overridden);
        assert_ne!(first.dataset_name, plain.dataset_name);
        assert_eq!(plain.table_name, "a");
    }

    #[test]
    fn test_password_rotation_keeps_identity() {
        let mk = |conn: &str| {
            let raw = RawSourceConfig {
                connection_string: Some(conn.to_string()),
                ..Default::default()
            };
            SourceConfigNormalizer::normalize(&raw, SourceKind::Relational).unwrap()
        };
        let a = PipelineIdentityResolver::resolve(&mk("postgres://app:old@db:5432/shop"));
        let b = PipelineIdentityResolver::resolve(&mk("postgres://app:new@db:5432/shop"));
        assert_eq!(a, b);
        assert_eq!(a.table_name, "shop");
    }

    fn unit(locator: &str) -> SourceUnit {
        SourceUnit {
            locator: locator.to_string(),
            name: file_stem(locator),
            format: None,
        }
    }

    #[test]
    fn test_colliding_unit_names_get_distinct_tables() {
        let identity = PipelineIdentityResolver::resolve(&fs_request("/data", None));
        let units = vec![
            unit("/data/a.json"),
            unit("/data/a.csv"),
            unit("/data/sub/a.csv"),
            unit("/data/2024-01.csv"),
            unit("/data/2024_01.csv"),
            unit("/data/b.csv"),
        ];

        let tables = identity.tables_for(&units);
        assert_eq!(tables[1], "a");
        assert_eq!(tables[3], "t_2024_01");
        assert_eq!(tables[5], "b");
        assert!(tables[0].starts_with("a_") && tables[0].len() == "a_".len() + 8);
        assert!(tables[4].starts_with("t_2024_01_"));
        let distinct: std::collections::BTreeSet<_> = tables.iter().collect();
        assert_eq!(distinct.len(), units.len());

        // Same units in another order resolve to the same tables
        let mut reversed = units.clone();
        reversed.reverse();
        let mut again = identity.tables_for(&reversed);
        again.reverse();
        assert_eq!(again, tables);
    }

    #[test]
    fn test_override_keeps_colliding_units_together() {
        let identity = PipelineIdentityResolver::resolve(&fs_request("/data", Some("everything")));
        let tables = identity.tables_for(&[unit("/data/a.json"), unit("/data/a.csv")]);
        assert_eq!(tables, vec!["everything", "everything"]);
    }

    #[test]
    fn test_sanitize_table_name() {
        assert_eq!(sanitize_table_name("Orders-2024.Q1"), "orders_2024_q1");
        assert_eq!(sanitize_table_name("2024_orders"), "t_2024_orders");
        assert_eq!(sanitize_table_name("   "), "unknown_table");
        assert_eq!(sanitize_table_name(&"x".repeat(100)).len(), 63);
    }

    #[test]
    fn test_unit_tables_follow_override() {
        let unit = SourceUnit {
            locator: "/data/us_states.csv".to_string(),
            name: "US States".to_string(),
            format: None,
        };
        let plain = PipelineIdentityResolver::resolve(&fs_request("/data", None));
        assert_eq!(plain.table_for(&unit), "us_states");

        let merged = PipelineIdentityResolver::resolve(&fs_request("/data", Some("all_rows")));
        assert_eq!(merged.table_for(&unit), "all_rows");
    }
}
