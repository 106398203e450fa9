//! Cluster bookkeeping around the external sequence clusterer.
//!
//! Multiplexing runs CD-HIT over the full sequence set so the expensive
//! all-vs-all search only sees cluster representatives. The `.clstr`
//! output is parsed into a representative -> members table that lives
//! until the demultiplex stage, where representative-level edges are
//! expanded back to the full member set with their scores preserved.

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::reduce::Edge;

/// Representative -> cluster members (the representative included).
#[derive(Debug, Default, Clone)]
pub struct ClusterTable {
    clusters: FxHashMap<String, Vec<String>>,
}

impl ClusterTable {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn total_members(&self) -> usize {
        self.clusters.values().map(Vec::len).sum()
    }

    pub fn members(&self, representative: &str) -> Option<&[String]> {
        self.clusters.get(representative).map(Vec::as_slice)
    }

    pub fn representatives(&self) -> impl Iterator<Item = &String> {
        self.clusters.keys()
    }

    pub fn is_representative(&self, id: &str) -> bool {
        self.clusters.contains_key(id)
    }

    /// Cluster size per representative, for the no-demux node attribute.
    pub fn sizes(&self) -> FxHashMap<String, usize> {
        self.clusters
            .iter()
            .map(|(rep, members)| (rep.clone(), members.len()))
            .collect()
    }
}

/// Parse CD-HIT `.clstr` output.
///
/// ```text
/// >Cluster 0
/// 0	120aa, >A0A001... *
/// 1	118aa, >B0B002... at 98.30%
/// ```
pub fn parse_clstr<R: BufRead>(reader: R) -> Result<ClusterTable> {
    let mut table = ClusterTable::default();
    let mut members: Vec<String> = Vec::new();
    let mut representative: Option<String> = None;
    let mut cluster_no = 0usize;

    let close_cluster = |members: &mut Vec<String>,
                             representative: &mut Option<String>,
                             table: &mut ClusterTable,
                             cluster_no: usize|
     -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let rep = representative
            .take()
            .ok_or_else(|| anyhow::anyhow!("Cluster {} has no representative", cluster_no))?;
        table.clusters.insert(rep, std::mem::take(members));
        Ok(())
    };

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }

        if line.starts_with('>') {
            close_cluster(&mut members, &mut representative, &mut table, cluster_no)?;
            cluster_no += 1;
            continue;
        }

        let id = member_id(&line)
            .ok_or_else(|| anyhow::anyhow!("Unparseable cluster member line: {}", line))?;
        if line.trim_end().ends_with('*') {
            representative = Some(id.clone());
        }
        members.push(id);
    }
    close_cluster(&mut members, &mut representative, &mut table, cluster_no)?;

    Ok(table)
}

fn member_id(line: &str) -> Option<String> {
    let start = line.find('>')? + 1;
    let rest = &line[start..];
    let end = rest.find("...").unwrap_or(rest.len());
    let id = rest[..end].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

pub fn parse_clstr_file(path: &Path) -> Result<ClusterTable> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open cluster file: {}", path.display()))?;
    parse_clstr(BufReader::with_capacity(1024 * 1024, file))
}

/// Capability seam over the external clusterer so the pipeline logic can
/// be exercised against in-memory fakes.
pub trait Clusterer {
    /// Cluster `input` into `output` (representatives FASTA); the cluster
    /// table is parsed from the tool's companion `.clstr` file.
    fn cluster(&self, input: &Path, output: &Path, sim: f64, lengthdif: f64)
        -> Result<ClusterTable>;
}

/// The real CD-HIT executable.
pub struct CdHit {
    exe: PathBuf,
}

impl CdHit {
    pub fn new(exe: &Path) -> Self {
        Self {
            exe: exe.to_path_buf(),
        }
    }
}

impl Clusterer for CdHit {
    fn cluster(
        &self,
        input: &Path,
        output: &Path,
        sim: f64,
        lengthdif: f64,
    ) -> Result<ClusterTable> {
        let out = Command::new(&self.exe)
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
            .args(["-c", &sim.to_string()])
            .args(["-s", &lengthdif.to_string()])
            // Full identifiers in the .clstr output
            .args(["-d", "0"])
            .output()
            .with_context(|| format!("Failed to run cd-hit: {}", self.exe.display()))?;

        if !out.status.success() {
            anyhow::bail!(
                "cd-hit failed (exit {:?}): {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }

        let clstr = clstr_path(output);
        parse_clstr_file(&clstr)
    }
}

/// CD-HIT writes the table next to the representatives FASTA.
pub fn clstr_path(output_fasta: &Path) -> PathBuf {
    let mut name = output_fasta.as_os_str().to_os_string();
    name.push(".clstr");
    PathBuf::from(name)
}

/// Expand representative-level edges back to member level.
///
/// Every edge `(rep_a, rep_b)` becomes the cartesian product of the two
/// clusters' members (minus self-pairs, which cannot occur across
/// distinct clusters) with the original score preserved. Edges whose
/// endpoint is not a known representative pass through unchanged.
pub fn demux_edges(edges: &[Edge], table: &ClusterTable) -> Vec<Edge> {
    let mut out = Vec::with_capacity(edges.len());

    for edge in edges {
        let members_a = table.members(&edge.a);
        let members_b = table.members(&edge.b);

        match (members_a, members_b) {
            (Some(members_a), Some(members_b)) => {
                for ma in members_a {
                    for mb in members_b {
                        if ma == mb {
                            continue;
                        }
                        let mut expanded = Edge {
                            a: ma.clone(),
                            b: mb.clone(),
                            ..edge.clone()
                        };
                        if expanded.a > expanded.b {
                            std::mem::swap(&mut expanded.a, &mut expanded.b);
                            std::mem::swap(&mut expanded.qlen, &mut expanded.slen);
                        }
                        out.push(expanded);
                    }
                }
            }
            _ => out.push(edge.clone()),
        }
    }

    out
}

/// Collapse duplicate edges, keeping the best-scoring row per unordered
/// pair. Input order is preserved for the survivors.
pub fn remove_dups(edges: Vec<Edge>) -> Vec<Edge> {
    let mut seen: FxHashSet<(String, String)> = FxHashSet::default();
    let mut out = Vec::with_capacity(edges.len());

    for edge in edges {
        let key = if edge.a <= edge.b {
            (edge.a.clone(), edge.b.clone())
        } else {
            (edge.b.clone(), edge.a.clone())
        };
        if seen.insert(key) {
            out.push(edge);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLSTR: &str = "\
>Cluster 0
0\t120aa, >A0A001... *
1\t118aa, >B0B002... at 98.30%
>Cluster 1
0\t90aa, >C0C003... *
";

    fn table() -> ClusterTable {
        parse_clstr(CLSTR.as_bytes()).unwrap()
    }

    fn edge(a: &str, b: &str, bits: f64) -> Edge {
        Edge {
            a: a.to_string(),
            b: b.to_string(),
            pident: 90.0,
            align_len: 50,
            bitscore: bits,
            qlen: 100,
            slen: 100,
        }
    }

    #[test]
    fn test_parse_clstr() {
        let table = table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.total_members(), 3);
        assert_eq!(
            table.members("A0A001").unwrap().to_vec(),
            vec!["A0A001", "B0B002"]
        );
        assert!(table.is_representative("C0C003"));
        assert!(!table.is_representative("B0B002"));
    }

    #[test]
    fn test_parse_clstr_missing_representative_fails() {
        let bad = ">Cluster 0\n0\t120aa, >A0A001... at 99%\n";
        assert!(parse_clstr(bad.as_bytes()).is_err());
    }

    #[test]
    fn test_demux_expands_cartesian_product() {
        let table = table();
        let expanded = demux_edges(&[edge("A0A001", "C0C003", 100.0)], &table);

        // 2 members x 1 member = 2 edges, scores preserved
        assert_eq!(expanded.len(), 2);
        assert!(expanded.iter().all(|e| e.bitscore == 100.0));
        assert!(expanded.iter().all(|e| e.a < e.b));

        let pairs: Vec<(String, String)> = expanded
            .iter()
            .map(|e| (e.a.clone(), e.b.clone()))
            .collect();
        assert!(pairs.contains(&("A0A001".to_string(), "C0C003".to_string())));
        assert!(pairs.contains(&("B0B002".to_string(), "C0C003".to_string())));
    }

    #[test]
    fn test_demux_output_at_least_input() {
        let table = table();
        let input = vec![edge("A0A001", "C0C003", 100.0)];
        let expanded = demux_edges(&input, &table);
        assert!(expanded.len() >= input.len());
    }

    #[test]
    fn test_remove_dups_keeps_first_per_pair() {
        let edges = vec![
            edge("A", "B", 100.0),
            edge("B", "A", 90.0),
            edge("A", "C", 80.0),
        ];
        let deduped = remove_dups(edges);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].bitscore, 100.0);
        assert_eq!(deduped[1].b, "C");
    }

    #[test]
    fn test_clstr_path() {
        assert_eq!(
            clstr_path(Path::new("/tmp/sequences.fa")),
            Path::new("/tmp/sequences.fa.clstr")
        );
    }
}
