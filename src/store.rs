//! Reference store access.
//!
//! Two external collaborators live behind this module: the read-only
//! relational store (family indexes, identifier mapping, annotations) and
//! the accession-indexed FASTA blob read through the external `fastacmd`
//! tool. Family IDs and accessions are untrusted user input, so every SQL
//! query binds them as parameters.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::FamilyKind;
use crate::fasta::FastaRecord;

/// A domain span on a sequence, 1-based inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

/// Read-only handle on the reference database.
pub struct ReferenceStore {
    conn: Connection,
}

impl ReferenceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open reference database: {}", path.display()))?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection. Used by tests with in-memory fixtures.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Enumerate `(accession, span)` members of one family.
    pub fn family_members(&self, kind: FamilyKind, family_id: &str) -> Result<Vec<(String, Span)>> {
        let sql = format!(
            "SELECT accession, start, end FROM {} WHERE id = ?1",
            kind.table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![family_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Span {
                    start: row.get::<_, i64>(1)? as u64,
                    end: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Member-row count of one family, for submission-time sizing.
    pub fn family_size(&self, kind: FamilyKind, family_id: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?1", kind.table());
        let count: i64 = self
            .conn
            .query_row(&sql, params![family_id], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Accession count under one taxonomy identifier.
    pub fn taxid_size(&self, taxid: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM TAXONOMY WHERE taxid = ?1",
            params![taxid],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Authoritative spans for one accession from the Pfam index.
    pub fn pfam_spans(&self, accession: &str) -> Result<Vec<Span>> {
        let mut stmt = self
            .conn
            .prepare("SELECT start, end FROM PFAM WHERE accession = ?1")?;
        let rows = stmt.query_map(params![accession], |row| {
            Ok(Span {
                start: row.get::<_, i64>(0)? as u64,
                end: row.get::<_, i64>(1)? as u64,
            })
        })?;

        let mut spans = Vec::new();
        for row in rows {
            spans.push(row?);
        }
        Ok(spans)
    }

    /// Reverse-map a foreign identifier to UniProt accessions.
    pub fn reverse_idmapping(&self, foreign_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uniprot_id FROM idmapping WHERE foreign_id = ?1")?;
        let rows = stmt.query_map(params![foreign_id], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Accessions recorded under one taxonomy identifier.
    pub fn taxid_accessions(&self, taxid: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT accession FROM TAXONOMY WHERE taxid = ?1")?;
        let rows = stmt.query_map(params![taxid], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Extra annotation key/value rows for one accession. Stores without an
    /// annotations table answer with an empty list.
    pub fn annotations(&self, accession: &str) -> Result<Vec<(String, String)>> {
        if !self.has_table("annotations")? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT attr_key, attr_value FROM annotations WHERE accession = ?1 ORDER BY attr_key",
        )?;
        let rows = stmt.query_map(params![accession], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    /// Version label stamped into `database_version` and the XGMML comment.
    pub fn database_version(&self) -> Result<Option<String>> {
        if !self.has_table("VERSION")? {
            return Ok(None);
        }
        let version: Option<String> = self
            .conn
            .query_row("SELECT version FROM VERSION LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(version)
    }
}

/// Result of an indexed blob read: recovered records plus the accessions
/// the blob did not know.
#[derive(Debug, Default)]
pub struct BlobFetch {
    pub records: Vec<FastaRecord>,
    pub missing: Vec<String>,
}

/// Accession-indexed reads from the reference FASTA blob via `fastacmd`.
pub struct SequenceBlob {
    fastacmd: PathBuf,
    blob: PathBuf,
    perpass: usize,
}

impl SequenceBlob {
    pub fn new(fastacmd: &Path, blob: &Path, perpass: usize) -> Self {
        Self {
            fastacmd: fastacmd.to_path_buf(),
            blob: blob.to_path_buf(),
            perpass: perpass.max(1),
        }
    }

    /// Fetch sequences for `accessions` in `perpass`-sized batches.
    ///
    /// A missing entry fails the whole `fastacmd` invocation, so the batch
    /// is retried without the accessions named in the recognized
    /// `ERROR: Entry "X" not found` pattern; those land in `missing` and
    /// become `FASTACMD` no-match records upstream.
    pub fn fetch(&self, accessions: &[String]) -> Result<BlobFetch> {
        let mut result = BlobFetch::default();

        for chunk in accessions.chunks(self.perpass) {
            let mut pending: Vec<String> = chunk.to_vec();

            loop {
                if pending.is_empty() {
                    break;
                }

                let output = Command::new(&self.fastacmd)
                    .arg("-d")
                    .arg(&self.blob)
                    .arg("-s")
                    .arg(pending.join(","))
                    .output()
                    .with_context(|| {
                        format!("Failed to run fastacmd: {}", self.fastacmd.display())
                    })?;

                let stderr = String::from_utf8_lossy(&output.stderr);
                let not_found = parse_not_found(&stderr);

                if not_found.is_empty() {
                    if !output.status.success() {
                        anyhow::bail!(
                            "fastacmd failed on batch of {} accessions: {}",
                            pending.len(),
                            stderr.trim()
                        );
                    }
                    let wanted: FxHashSet<&str> =
                        pending.iter().map(String::as_str).collect();
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    result
                        .records
                        .extend(parse_blob_output(&stdout, &wanted));
                    break;
                }

                let before = pending.len();
                for name in &not_found {
                    pending.retain(|a| a != name);
                }
                if pending.len() == before {
                    anyhow::bail!(
                        "fastacmd reported unknown entries {:?} not in the requested batch",
                        not_found
                    );
                }
                result.missing.extend(not_found);
            }
        }

        Ok(result)
    }
}

/// Extract accessions from `ERROR: Entry "X" not found` lines.
fn parse_not_found(stderr: &str) -> Vec<String> {
    let mut missing = Vec::new();
    for line in stderr.lines() {
        if !line.contains("not found") {
            continue;
        }
        if let Some(open) = line.find('"') {
            if let Some(close) = line[open + 1..].find('"') {
                let name = &line[open + 1..open + 1 + close];
                if !name.is_empty() {
                    missing.push(name.to_string());
                }
            }
        }
    }
    missing
}

/// Parse `fastacmd` output, normalizing headers like `>lcl|P00001 desc`
/// back to the bare accession we asked for.
fn parse_blob_output(text: &str, wanted: &FxHashSet<&str>) -> Vec<FastaRecord> {
    let mut records = Vec::new();
    let mut id: Option<String> = None;
    let mut seq = String::new();

    for line in text.lines() {
        if let Some(header) = line.strip_prefix('>') {
            if let Some(prev) = id.take() {
                records.push(FastaRecord { id: prev, seq: std::mem::take(&mut seq) });
            }
            id = Some(header_accession(header, wanted));
        } else if id.is_some() {
            seq.push_str(line.trim());
        }
    }
    if let Some(prev) = id {
        records.push(FastaRecord { id: prev, seq });
    }

    records
}

fn header_accession(header: &str, wanted: &FxHashSet<&str>) -> String {
    let token = header.split_whitespace().next().unwrap_or("");
    for segment in token.split('|') {
        if wanted.contains(segment) {
            return segment.to_string();
        }
    }
    // Fall back to the last database-qualified segment.
    token
        .split('|')
        .filter(|s| !s.is_empty())
        .next_back()
        .unwrap_or(token)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> ReferenceStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE PFAM (id TEXT, accession TEXT, start INTEGER, end INTEGER);
             CREATE TABLE INTERPRO (id TEXT, accession TEXT, start INTEGER, end INTEGER);
             CREATE TABLE GENE3D (id TEXT, accession TEXT, start INTEGER, end INTEGER);
             CREATE TABLE SSF (id TEXT, accession TEXT, start INTEGER, end INTEGER);
             CREATE TABLE idmapping (foreign_id TEXT, uniprot_id TEXT);
             CREATE TABLE TAXONOMY (taxid TEXT, accession TEXT);
             INSERT INTO PFAM VALUES ('PF00001', 'A0A001', 10, 50);
             INSERT INTO PFAM VALUES ('PF00001', 'B0B002', 1, 120);
             INSERT INTO PFAM VALUES ('PF00002', 'A0A001', 100, 140);
             INSERT INTO idmapping VALUES ('gi|12345', 'A0A001');
             INSERT INTO idmapping VALUES ('NP_000001.1', 'B0B002');
             INSERT INTO TAXONOMY VALUES ('562', 'A0A001');",
        )
        .unwrap();
        ReferenceStore::from_connection(conn)
    }

    #[test]
    fn test_family_members() {
        let store = fixture();
        let members = store.family_members(FamilyKind::Pfam, "PF00001").unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].0, "A0A001");
        assert_eq!(members[0].1, Span { start: 10, end: 50 });
    }

    #[test]
    fn test_family_and_taxid_sizes() {
        let store = fixture();
        assert_eq!(store.family_size(FamilyKind::Pfam, "PF00001").unwrap(), 2);
        assert_eq!(store.family_size(FamilyKind::Pfam, "PF09999").unwrap(), 0);
        assert_eq!(store.taxid_size("562").unwrap(), 1);
        assert_eq!(store.taxid_size("999").unwrap(), 0);
    }

    #[test]
    fn test_family_members_unknown_family_is_empty() {
        let store = fixture();
        let members = store.family_members(FamilyKind::Ssf, "SSF99999").unwrap();
        assert!(members.is_empty());
    }

    #[test]
    fn test_pfam_spans_accumulate_across_families() {
        let store = fixture();
        let spans = store.pfam_spans("A0A001").unwrap();
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_reverse_idmapping() {
        let store = fixture();
        assert_eq!(store.reverse_idmapping("gi|12345").unwrap(), vec!["A0A001"]);
        assert!(store.reverse_idmapping("gi|99999").unwrap().is_empty());
    }

    #[test]
    fn test_taxid_accessions() {
        let store = fixture();
        assert_eq!(store.taxid_accessions("562").unwrap(), vec!["A0A001"]);
    }

    #[test]
    fn test_annotations_without_table() {
        let store = fixture();
        assert!(store.annotations("A0A001").unwrap().is_empty());
        assert!(store.database_version().unwrap().is_none());
    }

    #[test]
    fn test_database_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE VERSION (version TEXT);
             INSERT INTO VERSION VALUES ('uniprot_2024_03');",
        )
        .unwrap();
        let store = ReferenceStore::from_connection(conn);
        assert_eq!(
            store.database_version().unwrap().as_deref(),
            Some("uniprot_2024_03")
        );
    }

    #[test]
    fn test_parse_not_found() {
        let stderr = "[fastacmd] ERROR: Entry \"X12345\" not found\nother noise\n";
        assert_eq!(parse_not_found(stderr), vec!["X12345"]);
        assert!(parse_not_found("clean run").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_blob_fetch_retries_around_missing_entry() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fastacmd");
        std::fs::write(
            &script,
            r#"#!/bin/sh
# fake fastacmd: -d <blob> -s <comma-separated ids>
ids=$4
for id in $(echo "$ids" | tr ',' ' '); do
  if [ "$id" = "MISSING" ]; then
    echo "[fastacmd] ERROR: Entry \"MISSING\" not found" >&2
    exit 1
  fi
  echo ">lcl|$id description"
  echo "MKVLLT"
done
"#,
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let blob = SequenceBlob::new(&script, Path::new("/dev/null"), 10);
        let fetch = blob
            .fetch(&[
                "P00001".to_string(),
                "MISSING".to_string(),
                "Q99999".to_string(),
            ])
            .unwrap();

        assert_eq!(fetch.missing, vec!["MISSING"]);
        assert_eq!(fetch.records.len(), 2);
        assert_eq!(fetch.records[0].id, "P00001");
        assert_eq!(fetch.records[0].seq, "MKVLLT");
        assert_eq!(fetch.records[1].id, "Q99999");
    }

    #[test]
    fn test_parse_blob_output_normalizes_headers() {
        let mut wanted = FxHashSet::default();
        wanted.insert("P00001");
        let text = ">lcl|P00001 some description\nMKV\nLLT\n>gnl|db|Q99999\nAAA\n";
        let records = parse_blob_output(text, &wanted);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "P00001");
        assert_eq!(records[0].seq, "MKVLLT");
        assert_eq!(records[1].id, "Q99999");
    }
}
