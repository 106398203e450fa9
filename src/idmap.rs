//! Reverse identifier resolution.
//!
//! Maps arbitrary accession inputs (NCBI GI numbers, GenBank/RefSeq IDs,
//! raw UniProt accessions) into the canonical UniProt space using the
//! reference store's idmapping table. Only the store answers; nothing is
//! fabricated here. Unmatched inputs are reported, never dropped.

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::fasta::looks_like_uniprot;
use crate::store::ReferenceStore;

/// Declared shape of the input identifiers. `Auto` sniffs per identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Auto,
    Uniprot,
    Ncbi,
    Genbank,
}

impl InputKind {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "auto" => Ok(InputKind::Auto),
            "uniprot" => Ok(InputKind::Uniprot),
            "ncbi" => Ok(InputKind::Ncbi),
            "genbank" => Ok(InputKind::Genbank),
            other => Err(format!(
                "Unknown id kind '{}'. Use auto, uniprot, ncbi or genbank.",
                other
            )),
        }
    }
}

/// Guess the kind of a single identifier from its shape.
pub fn sniff(id: &str) -> InputKind {
    if looks_like_uniprot(id) {
        InputKind::Uniprot
    } else if id.bytes().all(|b| b.is_ascii_digit()) && !id.is_empty() {
        InputKind::Ncbi
    } else {
        InputKind::Genbank
    }
}

/// Outcome of a reverse lookup over a batch of query identifiers.
#[derive(Debug, Default)]
pub struct ReverseLookup {
    /// Distinct UniProt accessions, in first-match order.
    pub ids: Vec<String>,
    /// Query identifiers the store could not map.
    pub unmatched: Vec<String>,
    /// UniProt accession -> every query identifier that named it.
    pub reverse_map: FxHashMap<String, Vec<String>>,
}

/// Resolve query identifiers to UniProt accessions.
///
/// Several query IDs may collapse onto one accession; the reverse map
/// keeps the full provenance. UniProt-shaped inputs pass through as
/// themselves, everything else is answered by the idmapping table.
pub fn reverse_lookup(
    store: &ReferenceStore,
    kind: InputKind,
    query_ids: &[String],
) -> Result<ReverseLookup> {
    let mut out = ReverseLookup::default();
    let mut seen: FxHashSet<String> = FxHashSet::default();

    let record = |out: &mut ReverseLookup, seen: &mut FxHashSet<String>, uniprot: String, query: &str| {
        out.reverse_map
            .entry(uniprot.clone())
            .or_default()
            .push(query.to_string());
        if seen.insert(uniprot.clone()) {
            out.ids.push(uniprot);
        }
    };

    for query in query_ids {
        let query = query.trim();
        if query.is_empty() {
            continue;
        }

        let effective = match kind {
            InputKind::Auto => sniff(query),
            explicit => explicit,
        };

        match effective {
            InputKind::Uniprot if looks_like_uniprot(query) => {
                record(&mut out, &mut seen, query.to_string(), query);
            }
            _ => {
                let mapped = store.reverse_idmapping(query)?;
                if mapped.is_empty() {
                    out.unmatched.push(query.to_string());
                } else {
                    for uniprot in mapped {
                        record(&mut out, &mut seen, uniprot, query);
                    }
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn fixture() -> ReferenceStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE idmapping (foreign_id TEXT, uniprot_id TEXT);
             INSERT INTO idmapping VALUES ('12345', 'P00001');
             INSERT INTO idmapping VALUES ('NP_000001.1', 'P00001');
             INSERT INTO idmapping VALUES ('XP_555.2', 'Q99999');",
        )
        .unwrap();
        ReferenceStore::from_connection(conn)
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff("P00001"), InputKind::Uniprot);
        assert_eq!(sniff("12345"), InputKind::Ncbi);
        assert_eq!(sniff("NP_000001.1"), InputKind::Genbank);
    }

    #[test]
    fn test_uniprot_passthrough() {
        let store = fixture();
        let ids = vec!["P00001".to_string()];
        let result = reverse_lookup(&store, InputKind::Auto, &ids).unwrap();
        assert_eq!(result.ids, vec!["P00001"]);
        assert!(result.unmatched.is_empty());
        assert_eq!(result.reverse_map["P00001"], vec!["P00001"]);
    }

    #[test]
    fn test_collapse_to_one_accession() {
        let store = fixture();
        let ids = vec!["12345".to_string(), "NP_000001.1".to_string()];
        let result = reverse_lookup(&store, InputKind::Auto, &ids).unwrap();
        assert_eq!(result.ids, vec!["P00001"]);
        assert_eq!(result.reverse_map["P00001"], vec!["12345", "NP_000001.1"]);
    }

    #[test]
    fn test_unmatched_reported() {
        let store = fixture();
        let ids = vec!["99999".to_string(), "XP_555.2".to_string()];
        let result = reverse_lookup(&store, InputKind::Auto, &ids).unwrap();
        assert_eq!(result.ids, vec!["Q99999"]);
        assert_eq!(result.unmatched, vec!["99999"]);
    }
}
