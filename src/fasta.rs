//! Sequence I/O Module
//!
//! FASTA reading and writing plus the streaming header parser used for
//! user-supplied input. Gzip-compressed files are detected by extension.
//!
//! The header parser walks input line by line through three externally
//! observable states: another header line for the current record
//! (`HeaderContinuation`), the first sequence line after a header region
//! (`Flush`, the point where the record's identifiers are resolved) and
//! any further sequence line (`Sequence`). Headers may carry several
//! UniProt accessions (merged FASTAs); sequences without any recognized
//! accession are kept as user sequences under synthetic `z`-padded IDs,
//! while recognized ones are discarded here and later re-fetched from the
//! reference blob so the canonical sequence wins.

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

/// A FASTA record: identifier plus residue sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub id: String,
    pub seq: String,
}

/// Where a selected sequence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqSource {
    UserFasta,
    Family,
    AccessionQuery,
}

impl SeqSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeqSource::UserFasta => "USER_FASTA",
            SeqSource::Family => "FAMILY",
            SeqSource::AccessionQuery => "ACCESSION_QUERY",
        }
    }
}

/// Metadata emitted for every sequence the parser saw.
#[derive(Debug, Clone)]
pub struct SeqMeta {
    pub id: String,
    pub description: String,
    pub query_ids: Vec<String>,
    pub other_ids: Vec<String>,
    pub seq_length: usize,
    pub source: SeqSource,
}

/// A UniProt accession found in a header, with the adjacent identifier it
/// was written next to (e.g. the entry name in `sp|P00001|FOO_BAR`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPair {
    pub uniprot_id: String,
    pub other_id: Option<String>,
}

// ============================================================================
// Readers and writers
// ============================================================================

/// Sequential reader over any byte source.
pub struct FastaReader<R: Read> {
    reader: BufReader<R>,
    line_buf: String,
    current_id: Option<String>,
}

impl<R: Read> FastaReader<R> {
    fn from_reader(inner: R) -> Result<Self> {
        let mut reader = Self {
            reader: BufReader::with_capacity(1024 * 1024, inner),
            line_buf: String::with_capacity(256),
            current_id: None,
        };

        // Prime state with the first header line
        reader.line_buf.clear();
        if reader.reader.read_line(&mut reader.line_buf)? > 0
            && reader.line_buf.starts_with('>')
        {
            reader.current_id = Some(first_token(&reader.line_buf[1..]));
        }

        Ok(reader)
    }

    pub fn read_next(&mut self) -> Result<Option<FastaRecord>> {
        let id = match self.current_id.take() {
            Some(n) => n,
            None => return Ok(None),
        };

        let mut seq = String::with_capacity(512);

        loop {
            self.line_buf.clear();
            if self.reader.read_line(&mut self.line_buf)? == 0 {
                break;
            }

            if self.line_buf.starts_with('>') {
                self.current_id = Some(first_token(&self.line_buf[1..]));
                break;
            }
            seq.push_str(self.line_buf.trim());
        }

        Ok(Some(FastaRecord { id, seq }))
    }
}

impl<R: Read> Iterator for FastaReader<R> {
    type Item = Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

fn first_token(header: &str) -> String {
    header.split_whitespace().next().unwrap_or("").to_string()
}

/// Auto-detecting FASTA file reader; `.gz` files are decompressed.
pub enum FastaFile {
    Plain(FastaReader<File>),
    Gzipped(FastaReader<MultiGzDecoder<File>>),
}

impl FastaFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open FASTA: {}", path.display()))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext == "gz" {
            Ok(FastaFile::Gzipped(FastaReader::from_reader(
                MultiGzDecoder::new(file),
            )?))
        } else {
            Ok(FastaFile::Plain(FastaReader::from_reader(file)?))
        }
    }

    pub fn read_next(&mut self) -> Result<Option<FastaRecord>> {
        match self {
            FastaFile::Plain(r) => r.read_next(),
            FastaFile::Gzipped(r) => r.read_next(),
        }
    }
}

impl Iterator for FastaFile {
    type Item = Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Write records as `>id` / sequence pairs.
pub fn write_records<W: Write>(out: &mut W, records: &[FastaRecord]) -> Result<()> {
    for record in records {
        writeln!(out, ">{}", record.id)?;
        writeln!(out, "{}", record.seq)?;
    }
    Ok(())
}

// ============================================================================
// Synthetic identifiers
// ============================================================================

/// Width of a synthetic identifier: counter right-padded with `z` so the
/// IDs sort after real accessions and are recognizable at a glance.
const SYNTHETIC_WIDTH: usize = 6;

pub fn synthetic_id(counter: usize) -> String {
    format!("{:z>width$}", counter, width = SYNTHETIC_WIDTH)
}

pub fn is_synthetic(id: &str) -> bool {
    let digits = id.trim_start_matches('z');
    id.starts_with('z') && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn synthetic_ordinal(id: &str) -> usize {
    id.trim_start_matches('z').parse().unwrap_or(0)
}

/// Order sequence identifiers: real accessions lexicographically, then
/// synthetic IDs by their numeric counter.
pub fn sort_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| match (is_synthetic(a), is_synthetic(b)) {
        (false, false) => a.cmp(b),
        (true, true) => synthetic_ordinal(a).cmp(&synthetic_ordinal(b)),
        (false, true) => std::cmp::Ordering::Less,
        (true, false) => std::cmp::Ordering::Greater,
    });
}

// ============================================================================
// Header parsing
// ============================================================================

/// Externally observable parser state for one input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// The line extends the current header region.
    HeaderContinuation,
    /// First sequence line after a header region; the record's identity
    /// is resolved at this point.
    Flush,
    /// Any further sequence line.
    Sequence,
}

/// Line-by-line scanner over the header/sequence structure of a FASTA.
pub struct HeaderScanner {
    headers: Vec<String>,
    in_header: bool,
}

impl HeaderScanner {
    pub fn new() -> Self {
        Self {
            headers: Vec::new(),
            in_header: false,
        }
    }

    pub fn feed(&mut self, line: &str) -> LineState {
        if line.starts_with('>') {
            if !self.in_header {
                self.headers.clear();
                self.in_header = true;
            }
            self.headers.push(line[1..].trim_end().to_string());
            LineState::HeaderContinuation
        } else if self.in_header {
            self.in_header = false;
            LineState::Flush
        } else {
            LineState::Sequence
        }
    }

    /// Header lines of the region that just flushed.
    pub fn take_headers(&mut self) -> Vec<String> {
        std::mem::take(&mut self.headers)
    }
}

impl Default for HeaderScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Does a token have the shape of a UniProt accession (6 or 10 uppercase
/// alphanumerics, letter-digit start, digit end)?
pub fn looks_like_uniprot(token: &str) -> bool {
    let bytes = token.as_bytes();
    if bytes.len() != 6 && bytes.len() != 10 {
        return false;
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    {
        return false;
    }
    bytes[0].is_ascii_uppercase() && bytes[1].is_ascii_digit() && bytes[bytes.len() - 1].is_ascii_digit()
}

/// Database tags that precede accessions in composite headers.
fn is_db_tag(token: &str) -> bool {
    matches!(
        token,
        "sp" | "tr" | "gi" | "ref" | "gb" | "emb" | "dbj" | "pdb" | "lcl" | "gnl"
    )
}

/// IDs and provenance extracted from one header region.
#[derive(Debug, Default)]
pub struct HeaderIds {
    pub uniprot_ids: Vec<IdPair>,
    pub other_ids: Vec<String>,
    pub raw: String,
}

/// Scan a header region for UniProt accessions and companion identifiers.
pub fn extract_header_ids(headers: &[String]) -> HeaderIds {
    let mut out = HeaderIds {
        raw: headers.join(" "),
        ..HeaderIds::default()
    };
    let mut seen: FxHashSet<String> = FxHashSet::default();

    for header in headers {
        for (position, token) in header.split_whitespace().enumerate() {
            let segments: Vec<&str> = token.split('|').collect();
            let mut matched_in_token = false;

            for (i, segment) in segments.iter().enumerate() {
                if looks_like_uniprot(segment) {
                    matched_in_token = true;
                    let other = segments
                        .get(i + 1)
                        .filter(|s| !s.is_empty() && !looks_like_uniprot(s))
                        .map(|s| s.to_string());
                    out.uniprot_ids.push(IdPair {
                        uniprot_id: segment.to_string(),
                        other_id: other,
                    });
                }
            }

            // Identifiers live in the leading token or in composite
            // db|id tokens; the rest of the header is description text.
            if !matched_in_token && (position == 0 || token.contains('|')) {
                for segment in &segments {
                    if !segment.is_empty() && !is_db_tag(segment) && seen.insert(segment.to_string())
                    {
                        out.other_ids.push(segment.to_string());
                    }
                }
            }
        }
    }

    out
}

// ============================================================================
// Whole-file parse for user input
// ============================================================================

/// Parsed user FASTA: metadata for every sequence, retained bodies for the
/// unmatched (synthetic) ones, and provenance for the recognized ones.
#[derive(Debug, Default)]
pub struct ParsedFasta {
    pub metadata: Vec<SeqMeta>,
    /// Bodies kept only for sequences without a recognized accession.
    pub user_records: Vec<FastaRecord>,
    /// All accessions recognized in headers, in encounter order.
    pub uniprot_ids: Vec<IdPair>,
    /// Accession -> companion IDs for repeated occurrences.
    pub duplicates: FxHashMap<String, Vec<String>>,
    /// Accession -> the query IDs by which the user referred to it.
    pub query_map: FxHashMap<String, Vec<String>>,
    pub sequence_count: usize,
}

/// Parse a user FASTA. With `use_headers` off every sequence is treated as
/// anonymous and kept under a synthetic ID; with it on, headers are mined
/// for accessions and matched bodies are discarded (the canonical sequence
/// is fetched from the reference blob instead).
pub fn parse_fasta(path: &Path, use_headers: bool) -> Result<ParsedFasta> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open FASTA: {}", path.display()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let reader: Box<dyn BufRead> = if ext == "gz" {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut parsed = ParsedFasta::default();
    let mut scanner = HeaderScanner::new();
    let mut synth_counter = 0usize;

    // Per-record accumulation between Flush and the next header region.
    let mut pending: Option<(HeaderIds, Vec<IdPair>)> = None;
    let mut seq = String::new();

    let flush_record =
        |parsed: &mut ParsedFasta,
         pending: &mut Option<(HeaderIds, Vec<IdPair>)>,
         seq: &mut String,
         synth_counter: &mut usize| {
            let Some((ids, fresh)) = pending.take() else {
                seq.clear();
                return;
            };
            parsed.sequence_count += 1;
            let description = truncate_chars(ids.raw.trim(), 200);

            if fresh.is_empty() && ids.uniprot_ids.is_empty() {
                // No recognized accession: keep the body under a synthetic ID.
                *synth_counter += 1;
                let id = synthetic_id(*synth_counter);
                parsed.metadata.push(SeqMeta {
                    id: id.clone(),
                    description,
                    query_ids: Vec::new(),
                    other_ids: ids.other_ids.clone(),
                    seq_length: seq.len(),
                    source: SeqSource::UserFasta,
                });
                parsed.user_records.push(FastaRecord {
                    id,
                    seq: std::mem::take(seq),
                });
            } else {
                for pair in fresh {
                    let mut query_ids = vec![pair.uniprot_id.clone()];
                    if let Some(other) = &pair.other_id {
                        query_ids.push(other.clone());
                    }
                    parsed
                        .query_map
                        .entry(pair.uniprot_id.clone())
                        .or_default()
                        .extend(query_ids.iter().cloned());
                    parsed.metadata.push(SeqMeta {
                        id: pair.uniprot_id.clone(),
                        description: description.clone(),
                        query_ids,
                        other_ids: ids.other_ids.clone(),
                        seq_length: seq.len(),
                        source: SeqSource::UserFasta,
                    });
                }
                seq.clear();
            }
        };

    let process_headers = |parsed: &mut ParsedFasta, headers: Vec<String>| -> (HeaderIds, Vec<IdPair>) {
        if !use_headers {
            return (
                HeaderIds {
                    raw: headers.join(" "),
                    ..HeaderIds::default()
                },
                Vec::new(),
            );
        }

        let ids = extract_header_ids(&headers);
        let mut fresh = Vec::new();
        for pair in &ids.uniprot_ids {
            parsed.uniprot_ids.push(pair.clone());
            let already = parsed.query_map.contains_key(&pair.uniprot_id)
                || fresh
                    .iter()
                    .any(|p: &IdPair| p.uniprot_id == pair.uniprot_id);
            if already {
                let entry = parsed
                    .duplicates
                    .entry(pair.uniprot_id.clone())
                    .or_default();
                if let Some(other) = &pair.other_id {
                    entry.push(other.clone());
                }
            } else {
                fresh.push(pair.clone());
            }
        }
        (ids, fresh)
    };

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match scanner.feed(&line) {
            LineState::HeaderContinuation => {
                // A new header region closes out the previous record.
                if scanner.headers.len() == 1 {
                    flush_record(&mut parsed, &mut pending, &mut seq, &mut synth_counter);
                }
            }
            LineState::Flush => {
                let headers = scanner.take_headers();
                pending = Some(process_headers(&mut parsed, headers));
                seq.push_str(line.trim());
            }
            LineState::Sequence => {
                seq.push_str(line.trim());
            }
        }
    }
    flush_record(&mut parsed, &mut pending, &mut seq, &mut synth_counter);

    Ok(parsed)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.fa");
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_scanner_states() {
        let mut scanner = HeaderScanner::new();
        assert_eq!(scanner.feed(">sp|P00001|FOO"), LineState::HeaderContinuation);
        assert_eq!(scanner.feed(">same record, more header"), LineState::HeaderContinuation);
        assert_eq!(scanner.feed("MKVLLT"), LineState::Flush);
        assert_eq!(scanner.feed("AAPGH"), LineState::Sequence);
        assert_eq!(scanner.feed(">next"), LineState::HeaderContinuation);
        assert_eq!(scanner.feed("TTT"), LineState::Flush);
    }

    #[test]
    fn test_uniprot_shape() {
        assert!(looks_like_uniprot("P00001"));
        assert!(looks_like_uniprot("A0A1B2C3D4"));
        assert!(!looks_like_uniprot("custom_xyz"));
        assert!(!looks_like_uniprot("FOO_BAR"));
        assert!(!looks_like_uniprot("P0000"));
        assert!(!looks_like_uniprot("p00001"));
    }

    #[test]
    fn test_synthetic_ids() {
        assert_eq!(synthetic_id(1), "zzzzz1");
        assert_eq!(synthetic_id(42), "zzzz42");
        assert!(is_synthetic("zzzzz1"));
        assert!(!is_synthetic("Z99999"));
        assert!(!is_synthetic("zebra1x"));
    }

    #[test]
    fn test_sort_ids_synthetic_after_real() {
        let mut ids = vec![
            "zzzz10".to_string(),
            "Q99999".to_string(),
            "zzzzz9".to_string(),
            "A0A001".to_string(),
        ];
        sort_ids(&mut ids);
        assert_eq!(ids, vec!["A0A001", "Q99999", "zzzzz9", "zzzz10"]);
    }

    #[test]
    fn test_extract_sp_header() {
        let headers = vec!["sp|P00001|FOO_BAR some receptor".to_string()];
        let ids = extract_header_ids(&headers);
        assert_eq!(ids.uniprot_ids.len(), 1);
        assert_eq!(ids.uniprot_ids[0].uniprot_id, "P00001");
        assert_eq!(ids.uniprot_ids[0].other_id.as_deref(), Some("FOO_BAR"));
    }

    #[test]
    fn test_extract_multiple_ids_one_header() {
        let headers = vec!["sp|P00001|FOO_BAR sp|Q99999|BAZ_QUX merged".to_string()];
        let ids = extract_header_ids(&headers);
        assert_eq!(ids.uniprot_ids.len(), 2);
        assert_eq!(ids.uniprot_ids[1].uniprot_id, "Q99999");
    }

    #[test]
    fn test_parse_mixed_fasta() {
        // One recognized accession, one anonymous sequence.
        let (_dir, path) = write_temp(
            ">sp|P00001|FOO_BAR test protein\nMKVLLT\n>custom_xyz\nAAPGHKL\n",
        );
        let parsed = parse_fasta(&path, true).unwrap();

        assert_eq!(parsed.sequence_count, 2);
        assert_eq!(parsed.metadata.len(), 2);
        assert_eq!(parsed.metadata[0].id, "P00001");
        assert_eq!(parsed.metadata[0].query_ids, vec!["P00001", "FOO_BAR"]);
        assert_eq!(parsed.metadata[1].id, "zzzzz1");
        assert_eq!(parsed.metadata[1].source, SeqSource::UserFasta);

        // Only the anonymous body is retained.
        assert_eq!(parsed.user_records.len(), 1);
        assert_eq!(parsed.user_records[0].id, "zzzzz1");
        assert_eq!(parsed.user_records[0].seq, "AAPGHKL");
    }

    #[test]
    fn test_parse_duplicates_recorded() {
        let (_dir, path) = write_temp(
            ">sp|P00001|FOO_BAR\nMKV\n>tr|P00001|ALT_NAME\nMKV\n",
        );
        let parsed = parse_fasta(&path, true).unwrap();
        assert_eq!(parsed.metadata.len(), 1);
        assert_eq!(
            parsed.duplicates.get("P00001").unwrap(),
            &vec!["ALT_NAME".to_string()]
        );
    }

    #[test]
    fn test_parse_headers_off_everything_synthetic() {
        let (_dir, path) = write_temp(">sp|P00001|FOO_BAR\nMKV\n>other\nTTT\n");
        let parsed = parse_fasta(&path, false).unwrap();
        assert_eq!(parsed.user_records.len(), 2);
        assert_eq!(parsed.user_records[0].id, "zzzzz1");
        assert_eq!(parsed.user_records[1].id, "zzzzz2");
        assert!(parsed.query_map.is_empty());
    }

    #[test]
    fn test_multiline_sequence_lengths() {
        let (_dir, path) = write_temp(">anon\nMKV\nLLT\nAAP\n");
        let parsed = parse_fasta(&path, true).unwrap();
        assert_eq!(parsed.metadata[0].seq_length, 9);
        assert_eq!(parsed.user_records[0].seq, "MKVLLTAAP");
    }

    #[test]
    fn test_reader_roundtrip() {
        let (_dir, path) = write_temp(">A0A001 desc\nMKVLLT\n>B0B002\nAAP\n");
        let records: Vec<FastaRecord> = FastaFile::open(&path)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "A0A001");
        assert_eq!(records[0].seq, "MKVLLT");

        let mut out = Vec::new();
        write_records(&mut out, &records).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            ">A0A001\nMKVLLT\n>B0B002\nAAP\n"
        );
    }
}
