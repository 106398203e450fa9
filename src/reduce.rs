//! Pairwise hit reduction.
//!
//! Turns the raw all-vs-all hit table (`blastfinal.tab`) into the final
//! edge list (`1.out`): hits are alphabetized so the lexicographically
//! smaller accession sits in column one, self-hits are dropped, the table
//! is externally sorted by `(a, b, bitscore desc)`, the best-scoring row
//! per unordered pair survives, and the survivors are re-sorted by
//! bitscore for downstream consumers. Hit tables routinely exceed memory,
//! hence the spill-to-disk sort.

use anyhow::{Context, Result};
use extsort_iter::*;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const LOG10_2: f64 = std::f64::consts::LOG10_2;

/// One similarity edge after normalization: `a < b` lexicographically.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub a: String,
    pub b: String,
    pub pident: f64,
    pub align_len: u64,
    pub bitscore: f64,
    pub qlen: u64,
    pub slen: u64,
}

impl Edge {
    /// Parse one raw hit row. The search stage requests
    /// `qseqid sseqid pident length mismatch gapopen qstart qend sstart
    /// send evalue bitscore qlen slen`; legacy blastall rows carry only
    /// the first twelve columns, in which case the lengths read as zero.
    pub fn parse_hit(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            anyhow::bail!("Invalid hit row: fewer than 12 fields");
        }

        Ok(Self {
            a: fields[0].to_string(),
            b: fields[1].to_string(),
            pident: fields[2].parse().context("Invalid percent identity")?,
            align_len: fields[3].parse().context("Invalid alignment length")?,
            bitscore: fields[11].parse().context("Invalid bitscore")?,
            qlen: fields.get(12).and_then(|f| f.parse().ok()).unwrap_or(0),
            slen: fields.get(13).and_then(|f| f.parse().ok()).unwrap_or(0),
        })
    }

    /// Parse one reduced row (`a b pident align_len bitscore qlen slen`).
    pub fn parse_reduced(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            anyhow::bail!("Invalid edge row: fewer than 7 fields");
        }

        Ok(Self {
            a: fields[0].to_string(),
            b: fields[1].to_string(),
            pident: fields[2].parse().context("Invalid percent identity")?,
            align_len: fields[3].parse().context("Invalid alignment length")?,
            bitscore: fields[4].parse().context("Invalid bitscore")?,
            qlen: fields[5].parse().context("Invalid query length")?,
            slen: fields[6].parse().context("Invalid subject length")?,
        })
    }

    /// Normalize so the smaller accession is first; self-hits vanish.
    /// Idempotent on already-normalized edges.
    pub fn alphabetize(mut self) -> Option<Self> {
        match self.a.cmp(&self.b) {
            Ordering::Equal => None,
            Ordering::Greater => {
                std::mem::swap(&mut self.a, &mut self.b);
                std::mem::swap(&mut self.qlen, &mut self.slen);
                Some(self)
            }
            Ordering::Less => Some(self),
        }
    }

    /// Network score: `⌊−log10(qlen·slen) + bitscore·log10(2)⌋`, an
    /// E-value-like quantity independent of database size.
    pub fn alignment_score(&self) -> i64 {
        let product = (self.qlen * self.slen) as f64;
        let log_term = if product > 0.0 { product.log10() } else { 0.0 };
        (-log_term + self.bitscore * LOG10_2).floor() as i64
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.a, self.b, self.pident, self.align_len, self.bitscore, self.qlen, self.slen
        )
    }
}

/// Sort wrapper ordering edges by pair, best bitscore first within a pair.
#[derive(Clone)]
struct PairOrd(Edge);

impl PartialEq for PairOrd {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PairOrd {}

impl PartialOrd for PairOrd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PairOrd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .a
            .cmp(&other.0.a)
            .then_with(|| self.0.b.cmp(&other.0.b))
            .then_with(|| other.0.bitscore.total_cmp(&self.0.bitscore))
    }
}

/// Tallies from one reduction run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReduceStats {
    pub hits_in: u64,
    pub self_hits: u64,
    pub edges_out: u64,
}

/// Reduce a raw hit table into the final edge list.
pub fn reduce_file(input: &Path, output: &Path, buffer_mb: usize) -> Result<ReduceStats> {
    let file = File::open(input)
        .with_context(|| format!("Failed to open hit table: {}", input.display()))?;
    let reader = BufReader::with_capacity(8 * 1024 * 1024, file);

    let mut stats = ReduceStats::default();
    let hits_in = AtomicU64::new(0);
    let self_hits = AtomicU64::new(0);

    let record_iter = reader.lines().filter_map(|line_result| {
        let line = line_result.ok()?;
        if line.is_empty() {
            return None;
        }
        let edge = Edge::parse_hit(&line).ok()?;
        hits_in.fetch_add(1, AtomicOrdering::Relaxed);
        match edge.alphabetize() {
            Some(edge) => Some(PairOrd(edge)),
            None => {
                self_hits.fetch_add(1, AtomicOrdering::Relaxed);
                None
            }
        }
    });

    let config =
        ExtsortConfig::with_buffer_size(buffer_mb.max(1) * 1024 * 1024).compress_lz4_flex();
    let sorted_iter = record_iter
        .par_external_sort(config)
        .context("External sort of hit table failed")?;

    // First row per (a, b) group carries the best bitscore.
    let mut edges: Vec<Edge> = Vec::new();
    let mut current: Option<(String, String)> = None;
    for PairOrd(edge) in sorted_iter {
        let key = (edge.a.clone(), edge.b.clone());
        if current.as_ref() != Some(&key) {
            current = Some(key);
            edges.push(edge);
        }
    }

    stats.hits_in = hits_in.load(AtomicOrdering::Relaxed);
    stats.self_hits = self_hits.load(AtomicOrdering::Relaxed);
    stats.edges_out = edges.len() as u64;

    edges.par_sort_unstable_by(|x, y| y.bitscore.total_cmp(&x.bitscore));

    let mut out = BufWriter::with_capacity(
        4 * 1024 * 1024,
        File::create(output)
            .with_context(|| format!("Failed to create edge list: {}", output.display()))?,
    );
    for edge in &edges {
        writeln!(out, "{}", edge.to_line())?;
    }
    out.flush()?;

    Ok(stats)
}

/// Load a reduced edge list back into memory.
pub fn read_edges(path: &Path) -> Result<Vec<Edge>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open edge list: {}", path.display()))?;
    let reader = BufReader::with_capacity(4 * 1024 * 1024, file);

    let mut edges = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        edges.push(Edge::parse_reduced(&line)?);
    }
    Ok(edges)
}

/// Write a reduced edge list.
pub fn write_edges(path: &Path, edges: &[Edge]) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path)
            .with_context(|| format!("Failed to create edge list: {}", path.display()))?,
    );
    for edge in edges {
        writeln!(out, "{}", edge.to_line())?;
    }
    out.flush()?;
    Ok(())
}
