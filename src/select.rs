//! Sequence selection core.
//!
//! Composes the resolver, header parser and family expander outputs into
//! the final candidate set: verifies accessions against the Pfam index,
//! deduplicates, enforces the sequence cap, applies the fraction policy
//! and materializes `allsequences.fa` together with the accession list,
//! the metadata file, the no-match report and the count summary. This is
//! what the `import` stage runs inside its batch job.

use anyhow::{Context, Result};
use log::{info, warn};
use rand::seq::SliceRandom;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::annot;
use crate::config::{InputSource, Params, Settings};
use crate::family;
use crate::fasta::{self, FastaRecord, ParsedFasta, SeqMeta, SeqSource};
use crate::idmap::{self, InputKind};
use crate::store::{ReferenceStore, SequenceBlob, Span};

/// Why a query identifier produced no usable sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMatchReason {
    NotFoundIdmapping,
    NotFoundDatabase,
    Duplicate,
    Fastacmd,
}

impl NoMatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoMatchReason::NotFoundIdmapping => "NOT_FOUND_IDMAPPING",
            NoMatchReason::NotFoundDatabase => "NOT_FOUND_DATABASE",
            NoMatchReason::Duplicate => "DUPLICATE",
            NoMatchReason::Fastacmd => "FASTACMD",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoMatch {
    pub id: String,
    pub reason: NoMatchReason,
}

/// One selected accession with its accumulated domain spans.
#[derive(Debug, Clone)]
pub struct Accession {
    pub id: String,
    pub spans: Vec<Span>,
    pub source: SeqSource,
}

/// The deduplicated, capped, fractioned candidate set.
#[derive(Debug, Default)]
pub struct Selection {
    pub accessions: Vec<Accession>,
    pub user_records: Vec<FastaRecord>,
    pub user_metadata: Vec<SeqMeta>,
    pub query_map: FxHashMap<String, Vec<String>>,
    pub no_match: Vec<NoMatch>,
}

/// Accumulates inputs from the three front-end components before the
/// selection rules run.
pub struct SelectionBuilder<'a> {
    store: &'a ReferenceStore,
    params: &'a Params,
    spans: FxHashMap<String, Vec<Span>>,
    sources: FxHashMap<String, SeqSource>,
    verify: Vec<(String, SeqSource)>,
    query_map: FxHashMap<String, Vec<String>>,
    user_records: Vec<FastaRecord>,
    user_metadata: Vec<SeqMeta>,
    no_match: Vec<NoMatch>,
}

impl<'a> SelectionBuilder<'a> {
    pub fn new(store: &'a ReferenceStore, params: &'a Params) -> Self {
        Self {
            store,
            params,
            spans: FxHashMap::default(),
            sources: FxHashMap::default(),
            verify: Vec::new(),
            query_map: FxHashMap::default(),
            user_records: Vec::new(),
            user_metadata: Vec::new(),
            no_match: Vec::new(),
        }
    }

    pub fn add_families(&mut self, refs: &[crate::config::FamilyRef]) -> Result<()> {
        let expanded = family::expand_families(self.store, refs)?;
        for (accession, spans) in expanded {
            self.sources.insert(accession.clone(), SeqSource::Family);
            self.spans.entry(accession).or_default().extend(spans);
        }
        Ok(())
    }

    /// Queue header-derived accessions for verification and keep the
    /// unmatched user sequences.
    pub fn add_fasta(&mut self, parsed: ParsedFasta) {
        for (uniprot, queries) in &parsed.query_map {
            self.verify.push((uniprot.clone(), SeqSource::UserFasta));
            self.query_map
                .entry(uniprot.clone())
                .or_default()
                .extend(queries.iter().cloned());
        }
        self.user_metadata = parsed.metadata;
        self.user_records = parsed.user_records;
    }

    /// Queue resolver output (accession-list or taxid input).
    pub fn add_resolved(&mut self, lookup: idmap::ReverseLookup) {
        for id in lookup.unmatched {
            self.no_match.push(NoMatch {
                id,
                reason: NoMatchReason::NotFoundIdmapping,
            });
        }
        for (uniprot, queries) in lookup.reverse_map {
            self.query_map
                .entry(uniprot.clone())
                .or_default()
                .extend(queries);
        }
        for id in lookup.ids {
            self.verify.push((id, SeqSource::AccessionQuery));
        }
    }

    /// Run the selection rules and consume the builder.
    ///
    /// `failed_marker` is created (and the run aborted) when the
    /// deduplicated count exceeds `maxsequence`.
    pub fn finish(mut self, failed_marker: &Path) -> Result<Selection> {
        // Verification pass: every C2/C3 accession is checked against the
        // Pfam index for its authoritative spans.
        let mut verified_seen: FxHashSet<String> = FxHashSet::default();
        for (id, source) in std::mem::take(&mut self.verify) {
            if !verified_seen.insert(id.clone()) {
                continue;
            }

            let spans = self.store.pfam_spans(&id)?;
            if spans.is_empty() {
                self.no_match.push(NoMatch {
                    id: id.clone(),
                    reason: NoMatchReason::NotFoundDatabase,
                });
                if !self.params.unverified {
                    continue;
                }
            }

            if self.spans.contains_key(&id) {
                // Already selected through a family source; keep one copy.
                self.no_match.push(NoMatch {
                    id: id.clone(),
                    reason: NoMatchReason::Duplicate,
                });
                self.spans.entry(id).or_default().extend(spans);
            } else {
                self.sources.insert(id.clone(), source);
                self.spans.insert(id, spans);
            }
        }

        // Capacity gate.
        let count = self.spans.len();
        if self.params.maxsequence > 0 && count > self.params.maxsequence {
            let mut marker = File::create(failed_marker).with_context(|| {
                format!("Failed to create marker: {}", failed_marker.display())
            })?;
            writeln!(
                marker,
                "Selected {} accessions, limit is {}",
                count, self.params.maxsequence
            )?;
            anyhow::bail!(
                "Too many sequences selected: {} > maxsequence {}",
                count,
                self.params.maxsequence
            );
        }

        // Fraction policy over the sorted accession list.
        let mut ids: Vec<String> = self.spans.keys().cloned().collect();
        ids.sort();
        let kept = apply_fraction(ids, self.params.fraction, self.params.random_fraction);

        let accessions = kept
            .into_iter()
            .map(|id| {
                let spans = self.spans.remove(&id).unwrap_or_default();
                let source = self
                    .sources
                    .get(&id)
                    .copied()
                    .unwrap_or(SeqSource::Family);
                Accession { id, spans, source }
            })
            .collect();

        Ok(Selection {
            accessions,
            user_records: self.user_records,
            user_metadata: self.user_metadata,
            query_map: self.query_map,
            no_match: self.no_match,
        })
    }
}

/// Submission-time estimate of the search-set size, used to scale batch
/// resource requests before anything runs. Counts the raw input source
/// and applies the fraction policy; verification misses and dedup make
/// the real number somewhat smaller, which only leaves headroom.
pub fn estimate_input_size(store: &ReferenceStore, params: &Params) -> Result<usize> {
    let raw = match &params.source {
        InputSource::Families(refs) => {
            let mut total = 0u64;
            for family in refs {
                total += store.family_size(family.kind, &family.id)?;
            }
            total as usize
        }
        InputSource::Accessions(ids) => ids.len(),
        InputSource::AccessionFile(path) => read_id_file(path)?.len(),
        InputSource::Fasta { path, .. } => {
            let mut count = 0usize;
            for record in fasta::FastaFile::open(path)? {
                record?;
                count += 1;
            }
            count
        }
        InputSource::Taxid(taxid) => store.taxid_size(taxid)? as usize,
    };

    Ok((raw / params.fraction.max(1)).max(1))
}

/// Keep every `k`-th accession of the sorted list (1-indexed), or a
/// uniform random sample of the same size.
pub fn apply_fraction(ids: Vec<String>, fraction: usize, random: bool) -> Vec<String> {
    if fraction <= 1 {
        return ids;
    }

    let target = ids.len() / fraction;
    if random {
        let mut rng = rand::thread_rng();
        let chosen: FxHashSet<String> = ids
            .choose_multiple(&mut rng, target)
            .cloned()
            .collect();
        ids.into_iter().filter(|id| chosen.contains(id)).collect()
    } else {
        ids.into_iter()
            .enumerate()
            .filter(|(i, _)| (i + 1) % fraction == 0)
            .map(|(_, id)| id)
            .collect()
    }
}

/// Result of writing `allsequences.fa`.
#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    pub written: usize,
    pub fetched: usize,
    pub length_filtered: usize,
    /// Full sequence length per accession, for the metadata file.
    pub lengths: FxHashMap<String, usize>,
    pub no_match: Vec<NoMatch>,
}

/// Fetch canonical sequences from the blob, window them when domain mode
/// is on, append the user sequences and write the working FASTA.
pub fn materialize(
    blob: &SequenceBlob,
    selection: &Selection,
    domain: bool,
    minlen: usize,
    maxlen: usize,
    out_path: &Path,
) -> Result<MaterializeOutcome> {
    let ids: Vec<String> = selection.accessions.iter().map(|a| a.id.clone()).collect();
    let fetch = blob.fetch(&ids)?;

    let mut outcome = MaterializeOutcome {
        fetched: fetch.records.len(),
        ..MaterializeOutcome::default()
    };
    for id in fetch.missing {
        outcome.no_match.push(NoMatch {
            id,
            reason: NoMatchReason::Fastacmd,
        });
    }

    let mut by_id: FxHashMap<&str, &FastaRecord> = FxHashMap::default();
    for record in &fetch.records {
        by_id.insert(record.id.as_str(), record);
        outcome.lengths.insert(record.id.clone(), record.seq.len());
    }

    let mut records: Vec<FastaRecord> = Vec::with_capacity(selection.accessions.len());
    for accession in &selection.accessions {
        let Some(full) = by_id.get(accession.id.as_str()) else {
            continue;
        };

        if domain && !accession.spans.is_empty() {
            for span in &accession.spans {
                let Some(window) = window_sequence(&full.seq, span) else {
                    warn!(
                        "{}: span {}:{} outside sequence of length {}",
                        accession.id,
                        span.start,
                        span.end,
                        full.seq.len()
                    );
                    continue;
                };
                records.push(FastaRecord {
                    id: format!("{}:{}:{}", accession.id, span.start, span.end),
                    seq: window,
                });
            }
        } else {
            records.push(FastaRecord {
                id: accession.id.clone(),
                seq: full.seq.clone(),
            });
        }
    }

    for user in &selection.user_records {
        outcome.lengths.insert(user.id.clone(), user.seq.len());
        records.push(user.clone());
    }

    let before = records.len();
    records.retain(|r| r.seq.len() >= minlen && (maxlen == 0 || r.seq.len() <= maxlen));
    outcome.length_filtered = before - records.len();
    outcome.written = records.len();

    let mut out = BufWriter::with_capacity(
        4 * 1024 * 1024,
        File::create(out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?,
    );
    fasta::write_records(&mut out, &records)?;
    out.flush()?;

    Ok(outcome)
}

/// Extract a 1-based inclusive window; `None` when it falls outside the
/// sequence.
fn window_sequence(seq: &str, span: &Span) -> Option<String> {
    if span.start == 0 || span.end < span.start || span.end as usize > seq.len() {
        return None;
    }
    Some(seq[span.start as usize - 1..span.end as usize].to_string())
}

/// One line per accession, or one line per `accession:start:end` window
/// in domain mode.
pub fn write_accession_file(path: &Path, selection: &Selection, domain: bool) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );

    for accession in &selection.accessions {
        if domain && !accession.spans.is_empty() {
            for span in &accession.spans {
                writeln!(out, "{}:{}:{}", accession.id, span.start, span.end)?;
            }
        } else {
            writeln!(out, "{}", accession.id)?;
        }
    }
    out.flush()?;
    Ok(())
}

pub fn write_no_match(path: &Path, entries: &[NoMatch]) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    for entry in entries {
        writeln!(out, "{}\t{}", entry.id, entry.reason.as_str())?;
    }
    out.flush()?;
    Ok(())
}

/// `name\tcount` tallies for operator inspection.
pub fn write_seq_counts(
    path: &Path,
    selection: &Selection,
    outcome: &MaterializeOutcome,
) -> Result<()> {
    let family = selection
        .accessions
        .iter()
        .filter(|a| a.source == SeqSource::Family)
        .count();
    let queried = selection
        .accessions
        .iter()
        .filter(|a| a.source != SeqSource::Family)
        .count();

    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    writeln!(out, "Family\t{}", family)?;
    writeln!(out, "Queried\t{}", queried)?;
    writeln!(out, "User\t{}", selection.user_records.len())?;
    writeln!(out, "LengthFiltered\t{}", outcome.length_filtered)?;
    writeln!(out, "Total\t{}", outcome.written)?;
    out.flush()?;
    Ok(())
}

fn read_id_file(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open accession file: {}", path.display()))?;
    let mut ids = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let id = line.trim();
        if id.is_empty() || id.starts_with('#') {
            continue;
        }
        ids.push(id.to_string());
    }
    Ok(ids)
}

/// Write the metadata file: one block per selected sequence, schema-known
/// keys first, store annotations appended.
fn write_metadata(
    path: &Path,
    store: &ReferenceStore,
    selection: &Selection,
    outcome: &MaterializeOutcome,
) -> Result<()> {
    let mut out = BufWriter::with_capacity(
        1024 * 1024,
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );

    let user_meta: FxHashMap<&str, &SeqMeta> = selection
        .user_metadata
        .iter()
        .map(|m| (m.id.as_str(), m))
        .collect();

    for accession in &selection.accessions {
        let mut attrs: Vec<(String, String)> = Vec::new();
        let meta = user_meta.get(accession.id.as_str());

        let description = meta.map(|m| m.description.clone()).unwrap_or_default();
        attrs.push(("Description".to_string(), description));

        if let Some(len) = outcome.lengths.get(&accession.id) {
            attrs.push(("Sequence_Length".to_string(), len.to_string()));
        }
        attrs.push((
            "Sequence_Source".to_string(),
            accession.source.as_str().to_string(),
        ));

        if let Some(queries) = selection.query_map.get(&accession.id) {
            attrs.push(("Query_IDs".to_string(), dedup_join(queries)));
        }
        if let Some(meta) = meta {
            if !meta.other_ids.is_empty() {
                attrs.push(("Other_IDs".to_string(), meta.other_ids.join(",")));
            }
        }

        attrs.extend(store.annotations(&accession.id)?);
        annot::sort_attrs(&mut attrs);
        annot::write_block(&mut out, &accession.id, &attrs)?;
    }

    for record in &selection.user_records {
        let mut attrs: Vec<(String, String)> = Vec::new();
        if let Some(meta) = user_meta.get(record.id.as_str()) {
            attrs.push(("Description".to_string(), meta.description.clone()));
            if !meta.other_ids.is_empty() {
                attrs.push(("Other_IDs".to_string(), meta.other_ids.join(",")));
            }
        }
        attrs.push(("Sequence_Length".to_string(), record.seq.len().to_string()));
        attrs.push((
            "Sequence_Source".to_string(),
            SeqSource::UserFasta.as_str().to_string(),
        ));
        annot::sort_attrs(&mut attrs);
        annot::write_block(&mut out, &record.id, &attrs)?;
    }

    out.flush()?;
    Ok(())
}

fn dedup_join(values: &[String]) -> String {
    let mut seen = FxHashSet::default();
    let mut out: Vec<&str> = Vec::new();
    for v in values {
        if seen.insert(v.as_str()) {
            out.push(v);
        }
    }
    out.join(",")
}

/// The import stage: selection, materialization and every small artifact
/// the rest of the pipeline reads.
pub fn run_import(workdir: &Path, params: &Params, settings: &Settings) -> Result<()> {
    let store = ReferenceStore::open(&settings.database)?;
    let mut builder = SelectionBuilder::new(&store, params);

    match &params.source {
        InputSource::Families(refs) => {
            builder.add_families(refs)?;
        }
        InputSource::Fasta { path, use_headers } => {
            let parsed = fasta::parse_fasta(path, *use_headers)?;
            info!(
                "parsed {} sequences from {} ({} matched, {} user)",
                parsed.sequence_count,
                path.display(),
                parsed.query_map.len(),
                parsed.user_records.len()
            );
            builder.add_fasta(parsed);
        }
        InputSource::Accessions(ids) => {
            let lookup = idmap::reverse_lookup(&store, InputKind::Auto, ids)?;
            builder.add_resolved(lookup);
        }
        InputSource::AccessionFile(path) => {
            let ids = read_id_file(path)?;
            let lookup = idmap::reverse_lookup(&store, InputKind::Auto, &ids)?;
            builder.add_resolved(lookup);
        }
        InputSource::Taxid(taxid) => {
            let ids = family::expand_taxid(&store, taxid)?;
            let lookup = idmap::ReverseLookup {
                reverse_map: ids.iter().map(|id| (id.clone(), vec![id.clone()])).collect(),
                ids,
                unmatched: Vec::new(),
            };
            builder.add_resolved(lookup);
        }
    }

    let failed_marker = workdir.join(format!("{}.failed", params.accession_output));
    let mut selection = builder.finish(&failed_marker)?;
    info!(
        "selected {} accessions, {} user sequences",
        selection.accessions.len(),
        selection.user_records.len()
    );

    let blob = SequenceBlob::new(&settings.fastacmd, &settings.blob, settings.perpass);
    let outcome = materialize(
        &blob,
        &selection,
        params.domain,
        params.minlen,
        params.maxlen,
        &workdir.join("allsequences.fa"),
    )?;
    selection.no_match.extend(outcome.no_match.iter().cloned());
    info!(
        "wrote {} sequences ({} fetched, {} filtered by length)",
        outcome.written, outcome.fetched, outcome.length_filtered
    );

    write_accession_file(
        &workdir.join(&params.accession_output),
        &selection,
        params.domain,
    )?;
    write_no_match(&workdir.join(&params.no_match_file), &selection.no_match)?;
    write_seq_counts(&workdir.join(&params.seq_count_file), &selection, &outcome)?;
    write_metadata(
        &workdir.join(&params.meta_file),
        &store,
        &selection,
        &outcome,
    )?;

    let version = store
        .database_version()?
        .or_else(|| settings.db_version.clone())
        .unwrap_or_else(|| "unknown".to_string());
    std::fs::write(workdir.join("database_version"), format!("{}\n", version))
        .context("Failed to write database_version")?;

    Ok(())
}
