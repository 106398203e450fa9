use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, Level};
use simple_logger::init_with_level;
use std::path::PathBuf;
use std::process::ExitCode;

use ssnet::config::{
    self, family_list, FamilyKind, InputSource, Params, SearchTool, Settings,
};
use ssnet::jobs::{self, CmdSubmitter, DryRunSubmitter, SchedulerKind};
use ssnet::select;
use ssnet::store::ReferenceStore;

#[derive(Parser)]
#[command(name = "ssnet")]
#[command(version)]
#[command(about = "Generate and submit a sequence similarity network pipeline")]
#[command(long_about = r#"
ssnet - sequence similarity network pipeline generator

Selects candidate sequences from protein families, accession lists or a
user FASTA, then submits a staged cluster pipeline that runs an
all-vs-all similarity search, reduces the hits to one edge per pair and
writes an annotated XGMML network.

PIPELINE STAGES:
  import -> multiplex -> fracfile -> createdb -> blast[1..np]
      -> cat -> reduce -> demux -> {conv_ratio, graphs}

The orchestrator only renders batch scripts and submits them; execution
order is enforced by scheduler dependencies. Progress and failures are
visible as files in the working directory: `1.out.completed` marks
success, `blast.failed` / `graphs.failed` mark stage failures.

EXAMPLES:
  # Whole Pfam family, defaults
  ssnet --pfam PF04055 --config ssnet.json --tmp pf04055

  # User FASTA with header mining, DIAMOND search, dry run
  ssnet --fasta-file seqs.fa --use-fasta-headers --blast diamond \
        --config ssnet.json --tmp myrun --dryrun
"#)]
struct Args {
    // ===== INPUT SELECTION =====
    /// InterPro family IDs, comma-separated
    #[arg(long = "ipro", value_name = "IDS", help_heading = "Input")]
    ipro: Option<String>,

    /// Pfam family IDs, comma-separated
    #[arg(long = "pfam", value_name = "IDS", help_heading = "Input")]
    pfam: Option<String>,

    /// Gene3D family IDs, comma-separated
    #[arg(long = "gene3d", value_name = "IDS", help_heading = "Input")]
    gene3d: Option<String>,

    /// SSF family IDs, comma-separated
    #[arg(long = "ssf", value_name = "IDS", help_heading = "Input")]
    ssf: Option<String>,

    /// Explicit accession IDs, comma-separated
    #[arg(long = "accession-id", value_name = "IDS", help_heading = "Input")]
    accession_id: Option<String>,

    /// File of accession IDs, one per line
    #[arg(long = "accession-file", value_name = "FILE", help_heading = "Input")]
    accession_file: Option<PathBuf>,

    /// User-supplied FASTA file (.fa or .fa.gz)
    #[arg(long = "fasta-file", value_name = "FILE", help_heading = "Input")]
    fasta_file: Option<PathBuf>,

    /// Mine FASTA headers for UniProt accessions
    #[arg(long = "use-fasta-headers", help_heading = "Input")]
    use_fasta_headers: bool,

    /// NCBI taxonomy ID
    #[arg(long = "taxid", value_name = "TAXID", help_heading = "Input")]
    taxid: Option<String>,

    // ===== FILTERING =====
    /// Emit one node per domain window instead of per sequence
    #[arg(long = "domain", value_name = "on|off", default_value = "off",
          value_parser = config::parse_switch, help_heading = "Filtering")]
    domain: bool,

    /// Keep every k-th accession of the sorted selection
    #[arg(long = "fraction", value_name = "K", default_value = "1", help_heading = "Filtering")]
    fraction: usize,

    /// Sample the fraction uniformly at random instead
    #[arg(long = "random-fraction", help_heading = "Filtering")]
    random_fraction: bool,

    /// Abort when more than this many accessions are selected (0 = no cap)
    #[arg(long = "maxsequence", value_name = "N", default_value = "0", help_heading = "Filtering")]
    maxsequence: usize,

    /// Drop sequences longer than this (0 = no limit)
    #[arg(long = "maxlen", value_name = "BP", default_value = "0", help_heading = "Filtering")]
    maxlen: usize,

    /// Drop sequences shorter than this
    #[arg(long = "minlen", value_name = "BP", default_value = "0", help_heading = "Filtering")]
    minlen: usize,

    /// Search e-value cutoff; a bare integer N means 1e-N
    #[arg(long = "evalue", value_name = "EVALUE", default_value = "5",
          value_parser = config::normalize_evalue, help_heading = "Filtering")]
    evalue: String,

    // ===== CLUSTERING =====
    /// Cluster sequences before the search so only representatives are searched
    #[arg(long = "multiplex", value_name = "on|off",
          value_parser = config::parse_switch, help_heading = "Clustering")]
    multiplex: Option<bool>,

    /// CD-HIT sequence identity threshold
    #[arg(long = "sim", value_name = "FRAC", default_value = "1.0", help_heading = "Clustering")]
    sim: f64,

    /// CD-HIT length difference cutoff
    #[arg(long = "lengthdif", value_name = "FRAC", default_value = "1.0", help_heading = "Clustering")]
    lengthdif: f64,

    /// Use a precomputed .clstr file; its representatives become the working set
    #[arg(long = "cd-hit", value_name = "FILE", help_heading = "Clustering")]
    cd_hit: Option<PathBuf>,

    /// Keep representative-level edges; record cluster sizes as node attributes
    #[arg(long = "no-demux", help_heading = "Clustering")]
    no_demux: bool,

    // ===== SIMILARITY SEARCH =====
    /// Search tool
    #[arg(long = "blast", value_name = "TOOL", default_value = "blast+",
          value_parser = SearchTool::parse, help_heading = "Similarity")]
    blast: SearchTool,

    /// Maximum hits kept per query
    #[arg(long = "blasthits", value_name = "N", default_value = "1000000", help_heading = "Similarity")]
    blasthits: usize,

    /// Array width of the search stage
    #[arg(long = "np", value_name = "N", default_value = "48", help_heading = "Similarity")]
    np: usize,

    /// Write a notice file instead of XGMML above this edge count
    #[arg(long = "maxfull", value_name = "N", default_value = "10000000", help_heading = "Similarity")]
    maxfull: usize,

    // ===== SCHEDULER =====
    /// Queue for ordinary stages
    #[arg(long = "queue", value_name = "QUEUE", default_value = "normal", help_heading = "Scheduler")]
    queue: String,

    /// Queue for memory-heavy stages (defaults to --queue)
    #[arg(long = "memqueue", value_name = "QUEUE", help_heading = "Scheduler")]
    memqueue: Option<String>,

    /// Scheduler flavor; probed from PATH when omitted
    #[arg(long = "scheduler", value_name = "torque|slurm",
          value_parser = SchedulerKind::parse, help_heading = "Scheduler")]
    scheduler: Option<SchedulerKind>,

    /// Working directory for all pipeline artifacts
    #[arg(long = "tmp", value_name = "DIR", default_value = "output", help_heading = "Scheduler")]
    tmp: PathBuf,

    /// Job name prefix
    #[arg(long = "job-id", value_name = "NAME", default_value = "ssnet", help_heading = "Scheduler")]
    job_id: String,

    /// Render scripts and simulate submission without a scheduler
    #[arg(long = "dryrun", help_heading = "Scheduler")]
    dryrun: bool,

    // ===== OUTPUTS =====
    /// Network file name (default: <job-id>_full_ssn.xgmml)
    #[arg(long = "out", value_name = "FILE", help_heading = "Output")]
    out: Option<String>,

    /// Per-sequence metadata file name
    #[arg(long = "meta-file", value_name = "FILE", default_value = "struct.out", help_heading = "Output")]
    meta_file: String,

    /// Accession list file name
    #[arg(long = "accession-output", value_name = "FILE", default_value = "accession.txt", help_heading = "Output")]
    accession_output: String,

    /// Unmatched-identifier report file name
    #[arg(long = "no-match-file", value_name = "FILE", default_value = "no_accession_matches.txt", help_heading = "Output")]
    no_match_file: String,

    /// Sequence count summary file name
    #[arg(long = "seq-count-file", value_name = "FILE", default_value = "seq_count.txt", help_heading = "Output")]
    seq_count_file: String,

    /// Write the convergence ratio of the final network to this file
    #[arg(long = "conv-ratio-file", value_name = "FILE", help_heading = "Output")]
    conv_ratio_file: Option<String>,

    // ===== CONFIG =====
    /// Site configuration file (database and tool locations)
    #[arg(long = "config", value_name = "FILE", required = true, help_heading = "Config")]
    config: PathBuf,

    /// Include accessions the Pfam index cannot verify
    #[arg(long = "unverified", help_heading = "Config")]
    unverified: bool,
}

impl Args {
    /// Collect the family flags into one query list.
    fn families(&self) -> Vec<config::FamilyRef> {
        let mut refs = Vec::new();
        if let Some(arg) = &self.ipro {
            refs.extend(family_list(FamilyKind::Interpro, arg));
        }
        if let Some(arg) = &self.pfam {
            refs.extend(family_list(FamilyKind::Pfam, arg));
        }
        if let Some(arg) = &self.gene3d {
            refs.extend(family_list(FamilyKind::Gene3d, arg));
        }
        if let Some(arg) = &self.ssf {
            refs.extend(family_list(FamilyKind::Ssf, arg));
        }
        refs
    }

    /// Exactly one input source must be chosen.
    fn input_source(&self) -> Result<InputSource> {
        let families = self.families();
        let mut sources: Vec<InputSource> = Vec::new();

        if !families.is_empty() {
            sources.push(InputSource::Families(families));
        }
        if let Some(ids) = &self.accession_id {
            sources.push(InputSource::Accessions(
                ids.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ));
        }
        if let Some(path) = &self.accession_file {
            sources.push(InputSource::AccessionFile(path.clone()));
        }
        if let Some(path) = &self.fasta_file {
            sources.push(InputSource::Fasta {
                path: path.clone(),
                use_headers: self.use_fasta_headers,
            });
        }
        if let Some(taxid) = &self.taxid {
            sources.push(InputSource::Taxid(taxid.clone()));
        }

        match sources.len() {
            0 => anyhow::bail!(
                "No input selected. Provide one of --ipro/--pfam/--gene3d/--ssf, \
                 --accession-id, --accession-file, --fasta-file or --taxid."
            ),
            1 => Ok(sources.into_iter().next().expect("one source")),
            n => anyhow::bail!(
                "{} input sources selected; exactly one of family list, accession \
                 list, FASTA or taxid is allowed.",
                n
            ),
        }
    }

    fn into_params(self) -> Result<(Params, PathBuf, Option<SchedulerKind>, bool)> {
        let source = self.input_source()?;
        let multiplex = self.multiplex.unwrap_or(self.cd_hit.is_none());
        let out = self
            .out
            .clone()
            .unwrap_or_else(|| format!("{}_full_ssn.xgmml", self.job_id));
        let memqueue = self.memqueue.clone().unwrap_or_else(|| self.queue.clone());

        let params = Params {
            job_id: self.job_id,
            source,
            domain: self.domain,
            fraction: self.fraction,
            random_fraction: self.random_fraction,
            maxsequence: self.maxsequence,
            minlen: self.minlen,
            maxlen: self.maxlen,
            evalue: self.evalue,
            multiplex,
            sim: self.sim,
            lengthdif: self.lengthdif,
            manual_cdhit: self.cd_hit,
            no_demux: self.no_demux,
            unverified: self.unverified,
            blast: self.blast,
            blasthits: self.blasthits,
            np: self.np,
            maxfull: self.maxfull,
            queue: self.queue,
            memqueue,
            out,
            meta_file: self.meta_file,
            accession_output: self.accession_output,
            no_match_file: self.no_match_file,
            seq_count_file: self.seq_count_file,
            conv_ratio_file: self.conv_ratio_file,
        };
        params.validate()?;

        Ok((params, self.tmp, self.scheduler, self.dryrun))
    }
}

fn run(args: Args) -> Result<()> {
    let config_path = args.config.clone();
    let settings = Settings::load(&config_path)?;
    if !settings.database.exists() {
        anyhow::bail!(
            "Reference database not found: {}",
            settings.database.display()
        );
    }

    let (params, workdir, scheduler, dryrun) = args.into_params()?;

    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("Failed to create working directory: {}", workdir.display()))?;
    let workdir = workdir
        .canonicalize()
        .context("Failed to resolve working directory")?;
    let config_path = config_path
        .canonicalize()
        .context("Failed to resolve config path")?;

    params.save(&workdir.join("params.json"))?;

    // Size the resource requests from a cheap pre-pass over the input.
    let store = ReferenceStore::open(&settings.database)?;
    let seq_estimate = select::estimate_input_size(&store, &params)?;
    drop(store);

    let kind = scheduler.unwrap_or_else(jobs::detect_scheduler);
    info!(
        "scheduler: {:?}, search: {:?}, fan-out: {}, ~{} sequences",
        kind,
        params.blast,
        params.effective_np(),
        seq_estimate
    );

    let stages = jobs::build_pipeline(&params, &workdir, &config_path, seq_estimate);

    let submitted = if dryrun {
        let mut submitter = DryRunSubmitter::default();
        let submitted =
            jobs::submit_pipeline(kind, &workdir, &params.job_id, &stages, &mut submitter)?;
        info!("dry run: {} stage scripts rendered, nothing submitted", submitted.len());
        submitted
    } else {
        let mut submitter = CmdSubmitter::new(kind);
        jobs::submit_pipeline(kind, &workdir, &params.job_id, &stages, &mut submitter)?
    };

    for stage in &submitted {
        info!("  {:<12} {}", stage.name, stage.job_id);
    }
    info!(
        "pipeline submitted; watch {} for 1.out.completed",
        workdir.display()
    );

    Ok(())
}

fn main() -> ExitCode {
    init_with_level(Level::Info).ok();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
