//! Run configuration: the site config file, the per-run parameter set and
//! the mutual-constraint checks applied before anything is submitted.
//!
//! The site config is a small JSON file naming the reference database, the
//! indexed FASTA blob and the external tools. Per-run parameters are
//! assembled by the orchestrator from command-line flags, validated here,
//! then serialized into the working directory so the import stage (which
//! runs later, inside a batch job) sees exactly what was validated.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Default number of accessions per `fastacmd` invocation.
const DEFAULT_PERPASS: usize = 1000;

/// Site configuration loaded from the `--config` JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the reference SQLite database.
    pub database: PathBuf,
    /// Path to the accession-indexed FASTA blob.
    pub blob: PathBuf,
    /// `fastacmd` executable used for indexed blob reads.
    #[serde(default = "default_fastacmd")]
    pub fastacmd: PathBuf,
    /// `cd-hit` executable used for multiplexing.
    #[serde(default = "default_cdhit")]
    pub cd_hit: PathBuf,
    /// Accessions fetched per `fastacmd` invocation.
    #[serde(default = "default_perpass")]
    pub perpass: usize,
    /// Fallback database version label when the store carries none.
    #[serde(default)]
    pub db_version: Option<String>,
}

fn default_fastacmd() -> PathBuf {
    PathBuf::from("fastacmd")
}

fn default_cdhit() -> PathBuf {
    PathBuf::from("cd-hit")
}

fn default_perpass() -> usize {
    DEFAULT_PERPASS
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;
        let settings: Settings = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if settings.database.as_os_str().is_empty() {
            anyhow::bail!("Config file does not name a reference database");
        }
        if settings.perpass == 0 {
            anyhow::bail!("perpass must be at least 1");
        }

        Ok(settings)
    }
}

/// Which similarity search tool the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchTool {
    Blast,
    BlastPlus,
    BlastPlusSimple,
    Diamond,
    DiamondSensitive,
}

impl SearchTool {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "blast" => Ok(SearchTool::Blast),
            "blast+" => Ok(SearchTool::BlastPlus),
            "blast+simple" => Ok(SearchTool::BlastPlusSimple),
            "diamond" => Ok(SearchTool::Diamond),
            "diamondsensitive" => Ok(SearchTool::DiamondSensitive),
            other => Err(format!(
                "Unknown search tool '{}'. Use blast, blast+, blast+simple, diamond or diamondsensitive.",
                other
            )),
        }
    }

    /// DIAMOND parallelizes internally, so the array fan-out is rescaled.
    pub fn is_diamond(&self) -> bool {
        matches!(self, SearchTool::Diamond | SearchTool::DiamondSensitive)
    }
}

/// Family index kinds understood by the reference store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FamilyKind {
    Interpro,
    Pfam,
    Gene3d,
    Ssf,
}

impl FamilyKind {
    /// Reference-store table backing this family index.
    pub fn table(&self) -> &'static str {
        match self {
            FamilyKind::Interpro => "INTERPRO",
            FamilyKind::Pfam => "PFAM",
            FamilyKind::Gene3d => "GENE3D",
            FamilyKind::Ssf => "SSF",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FamilyKind::Interpro => "InterPro",
            FamilyKind::Pfam => "Pfam",
            FamilyKind::Gene3d => "Gene3D",
            FamilyKind::Ssf => "SSF",
        }
    }
}

/// One family query: index kind plus family identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRef {
    pub kind: FamilyKind,
    pub id: String,
}

/// The single input source selected for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InputSource {
    Families(Vec<FamilyRef>),
    Accessions(Vec<String>),
    AccessionFile(PathBuf),
    Fasta { path: PathBuf, use_headers: bool },
    Taxid(String),
}

/// Validated per-run parameters, written to `params.json` in the working
/// directory and read back by the import stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    pub job_id: String,
    pub source: InputSource,
    pub domain: bool,
    pub fraction: usize,
    pub random_fraction: bool,
    pub maxsequence: usize,
    pub minlen: usize,
    pub maxlen: usize,
    pub evalue: String,
    pub multiplex: bool,
    pub sim: f64,
    pub lengthdif: f64,
    pub manual_cdhit: Option<PathBuf>,
    pub no_demux: bool,
    pub unverified: bool,
    pub blast: SearchTool,
    pub blasthits: usize,
    pub np: usize,
    pub maxfull: usize,
    pub queue: String,
    pub memqueue: String,
    pub out: String,
    pub meta_file: String,
    pub accession_output: String,
    pub no_match_file: String,
    pub seq_count_file: String,
    pub conv_ratio_file: Option<String>,
}

impl Params {
    /// Cross-field checks that must hold before any script is rendered.
    pub fn validate(&self) -> Result<()> {
        if self.fraction == 0 {
            anyhow::bail!("--fraction must be a positive integer");
        }
        if !(0.0..=1.0).contains(&self.sim) {
            anyhow::bail!("--sim must be between 0 and 1, got {}", self.sim);
        }
        if !(0.0..=1.0).contains(&self.lengthdif) {
            anyhow::bail!("--lengthdif must be between 0 and 1, got {}", self.lengthdif);
        }
        if self.np == 0 {
            anyhow::bail!("--np must be at least 1");
        }
        if self.maxlen > 0 && self.minlen > self.maxlen {
            anyhow::bail!(
                "--minlen {} exceeds --maxlen {}",
                self.minlen,
                self.maxlen
            );
        }
        if self.random_fraction && self.fraction == 1 {
            anyhow::bail!("--random-fraction has no effect with --fraction 1");
        }
        if self.manual_cdhit.is_some() && self.multiplex {
            anyhow::bail!("--cd-hit replaces multiplexing; use --multiplex off with it");
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create params file: {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context("Failed to serialize run parameters")?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open params file: {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse params file: {}", path.display()))
    }

    /// Array width for the search stage. DIAMOND runs fewer, fatter tasks
    /// because it threads internally.
    pub fn effective_np(&self) -> usize {
        if self.blast.is_diamond() {
            (self.np / 24).max(1)
        } else {
            self.np
        }
    }
}

/// Parse an on/off switch flag.
pub fn parse_switch(s: &str) -> Result<bool, String> {
    match s {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("Expected 'on' or 'off', got '{}'", other)),
    }
}

/// Normalize an e-value argument: a bare integer `N` means `1e-N`, an
/// explicit `1e-N` form is kept as written.
pub fn normalize_evalue(s: &str) -> Result<String, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("Empty e-value".to_string());
    }
    if let Ok(exp) = trimmed.parse::<u32>() {
        return Ok(format!("1e-{}", exp));
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v > 0.0 => Ok(trimmed.to_string()),
        Ok(v) => Err(format!("E-value must be positive, got {}", v)),
        Err(_) => Err(format!("Invalid e-value: '{}'", trimmed)),
    }
}

/// Split a comma-separated family list into refs of one kind.
pub fn family_list(kind: FamilyKind, arg: &str) -> Vec<FamilyRef> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|id| FamilyRef {
            kind,
            id: id.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> Params {
        Params {
            job_id: "job1".to_string(),
            source: InputSource::Families(family_list(FamilyKind::Pfam, "PF00001")),
            domain: false,
            fraction: 1,
            random_fraction: false,
            maxsequence: 0,
            minlen: 0,
            maxlen: 0,
            evalue: "1e-5".to_string(),
            multiplex: false,
            sim: 1.0,
            lengthdif: 1.0,
            manual_cdhit: None,
            no_demux: false,
            unverified: false,
            blast: SearchTool::BlastPlus,
            blasthits: 250,
            np: 48,
            maxfull: 10_000_000,
            queue: "normal".to_string(),
            memqueue: "highmem".to_string(),
            out: "ssn.xgmml".to_string(),
            meta_file: "struct.out".to_string(),
            accession_output: "accession.txt".to_string(),
            no_match_file: "no_accession_matches.txt".to_string(),
            seq_count_file: "seq_count.txt".to_string(),
            conv_ratio_file: None,
        }
    }

    #[test]
    fn test_evalue_normalization() {
        assert_eq!(normalize_evalue("5").unwrap(), "1e-5");
        assert_eq!(normalize_evalue("1e-20").unwrap(), "1e-20");
        assert!(normalize_evalue("-3.0").is_err());
        assert!(normalize_evalue("abc").is_err());
    }

    #[test]
    fn test_switch_parsing() {
        assert!(parse_switch("on").unwrap());
        assert!(!parse_switch("off").unwrap());
        assert!(parse_switch("yes").is_err());
    }

    #[test]
    fn test_fraction_must_be_positive() {
        let mut p = base_params();
        p.fraction = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_sim_range() {
        let mut p = base_params();
        p.sim = 1.2;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_diamond_np_rescale() {
        let mut p = base_params();
        p.np = 48;
        p.blast = SearchTool::Diamond;
        assert_eq!(p.effective_np(), 2);
        p.np = 10;
        assert_eq!(p.effective_np(), 1);
        p.blast = SearchTool::BlastPlus;
        assert_eq!(p.effective_np(), 10);
    }

    #[test]
    fn test_family_list_split() {
        let refs = family_list(FamilyKind::Interpro, "IPR000001, IPR000002,");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].id, "IPR000001");
        assert_eq!(refs[1].kind, FamilyKind::Interpro);
    }

    #[test]
    fn test_params_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let p = base_params();
        p.save(&path).unwrap();
        let back = Params::load(&path).unwrap();
        assert_eq!(back.job_id, "job1");
        assert_eq!(back.evalue, "1e-5");
        assert!(matches!(back.source, InputSource::Families(ref f) if f.len() == 1));
    }
}
