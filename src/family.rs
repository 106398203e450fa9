//! Family-to-accession expansion.
//!
//! Each family query (InterPro, Pfam, Gene3D, SSF) enumerates accessions
//! and their domain windows from the reference store. Families are
//! independent; an accession hit by several queries accumulates the union
//! of its spans.

use anyhow::Result;
use log::{info, warn};
use rustc_hash::FxHashMap;

use crate::config::FamilyRef;
use crate::store::{ReferenceStore, Span};

/// Accession -> accumulated domain spans.
pub type SpanMap = FxHashMap<String, Vec<Span>>;

/// Expand family queries into the shared accession/span map.
pub fn expand_families(store: &ReferenceStore, families: &[FamilyRef]) -> Result<SpanMap> {
    let mut spans: SpanMap = FxHashMap::default();

    for family in families {
        let members = store.family_members(family.kind, &family.id)?;
        if members.is_empty() {
            warn!("{} {}: no accessions in reference store", family.kind.label(), family.id);
            continue;
        }

        let added = members.len();
        for (accession, span) in members {
            spans.entry(accession).or_default().push(span);
        }

        info!(
            "{} {}: {} members, {} accessions total",
            family.kind.label(),
            family.id,
            added,
            spans.len()
        );
    }

    Ok(spans)
}

/// Expand a taxonomy identifier into its accession list.
pub fn expand_taxid(store: &ReferenceStore, taxid: &str) -> Result<Vec<String>> {
    let accessions = store.taxid_accessions(taxid)?;
    info!("taxid {}: {} accessions", taxid, accessions.len());
    Ok(accessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{family_list, FamilyKind};
    use rusqlite::Connection;

    fn fixture() -> ReferenceStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE PFAM (id TEXT, accession TEXT, start INTEGER, end INTEGER);
             CREATE TABLE INTERPRO (id TEXT, accession TEXT, start INTEGER, end INTEGER);
             INSERT INTO PFAM VALUES ('PF00001', 'A0A001', 10, 50);
             INSERT INTO PFAM VALUES ('PF00001', 'B0B002', 1, 90);
             INSERT INTO INTERPRO VALUES ('IPR000001', 'A0A001', 100, 140);",
        )
        .unwrap();
        ReferenceStore::from_connection(conn)
    }

    #[test]
    fn test_span_union_across_families() {
        let store = fixture();
        let mut families = family_list(FamilyKind::Pfam, "PF00001");
        families.extend(family_list(FamilyKind::Interpro, "IPR000001"));

        let spans = expand_families(&store, &families).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans["A0A001"].len(), 2);
        assert_eq!(spans["A0A001"][1], Span { start: 100, end: 140 });
        assert_eq!(spans["B0B002"].len(), 1);
    }

    #[test]
    fn test_empty_family_is_not_fatal() {
        let store = fixture();
        let families = family_list(FamilyKind::Pfam, "PF09999");
        let spans = expand_families(&store, &families).unwrap();
        assert!(spans.is_empty());
    }
}
