//! In-job pipeline worker.
//!
//! The orchestrator renders batch scripts that call back into this binary,
//! one subcommand per stage with in-process logic. Every subcommand reads
//! the validated run parameters from `params.json` in the working
//! directory, so a stage sees exactly what the orchestrator checked at
//! submission time.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn, Level};
use simple_logger::init_with_level;
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ssnet::annot;
use ssnet::cluster::{self, Clusterer};
use ssnet::config::{Params, Settings};
use ssnet::fasta::{self, FastaFile};
use ssnet::reduce;
use ssnet::select;
use ssnet::xgmml;

#[derive(Parser)]
#[command(name = "ssnet-stage")]
#[command(version)]
#[command(about = "Run one stage of a submitted ssnet pipeline")]
struct Args {
    /// Pipeline working directory
    #[arg(long = "dir", value_name = "DIR", global = true, default_value = ".")]
    dir: PathBuf,

    /// Site configuration file (needed by import and multiplex)
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Select, deduplicate and materialize the candidate sequences
    Import,
    /// Cluster the sequence set (or pass it through) before the search
    Multiplex,
    /// Split the working FASTA into the search fan-out parts
    Fracfile,
    /// Concatenate the per-task hit tables; gate on empty output
    Cat,
    /// Reduce raw hits to one edge per pair
    Reduce {
        /// In-memory sort buffer before spilling to disk
        #[arg(long = "buffer-mb", default_value = "512")]
        buffer_mb: usize,
    },
    /// Expand representative edges back to cluster members
    Demux,
    /// Compute the convergence ratio of the final edge list
    ConvRatio,
    /// Write the XGMML network and the completion marker
    Xgmml,
}

fn load_params(dir: &Path) -> Result<Params> {
    Params::load(&dir.join("params.json"))
}

fn load_settings(config: &Option<PathBuf>) -> Result<Settings> {
    let path = config
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--config is required for this stage"))?;
    Settings::load(path)
}

/// The FASTA whose record order defines the network's node order: the
/// full set when edges are demultiplexed back, the representative set
/// otherwise.
fn node_space(dir: &Path, params: &Params) -> PathBuf {
    if params.multiplex && !params.no_demux && params.manual_cdhit.is_none() {
        dir.join("allsequences.fa")
    } else {
        dir.join("sequences.fa")
    }
}

fn run_multiplex(dir: &Path, params: &Params, config: &Option<PathBuf>) -> Result<()> {
    let all = dir.join("allsequences.fa");
    let seqs = dir.join("sequences.fa");

    if let Some(clstr) = &params.manual_cdhit {
        // Precomputed clustering: its representatives become the working set.
        let table = cluster::parse_clstr_file(clstr)?;

        if params.maxsequence > 0 && table.len() > params.maxsequence {
            let marker = dir.join(format!("{}.failed", params.accession_output));
            fs::write(
                &marker,
                format!(
                    "Cluster table has {} representatives, limit is {}\n",
                    table.len(),
                    params.maxsequence
                ),
            )?;
            anyhow::bail!(
                "Too many representatives: {} > maxsequence {}",
                table.len(),
                params.maxsequence
            );
        }

        let mut kept = 0usize;
        let mut out = BufWriter::new(File::create(&seqs)?);
        for record in FastaFile::open(&all)? {
            let record = record?;
            if table.is_representative(&record.id) {
                fasta::write_records(&mut out, std::slice::from_ref(&record))?;
                kept += 1;
            }
        }
        out.flush()?;

        // Keep the table next to the working set for downstream stages.
        fs::copy(clstr, cluster::clstr_path(&seqs))?;

        let meta = dir.join(&params.meta_file);
        let mut annots = annot::read_annotations(&meta)?;
        annots.retain(|acc| {
            table.is_representative(acc)
                || table
                    .representatives()
                    .any(|rep| xgmml::parse_domain_id(rep).map(|(b, _, _)| b) == Some(acc))
        });
        annot::write_annotations(&meta, &annots)?;

        info!(
            "manual cluster table: {} representatives kept of {} sequences",
            kept,
            table.total_members()
        );
    } else if params.multiplex {
        let settings = load_settings(config)?;
        let cdhit = cluster::CdHit::new(&settings.cd_hit);
        let table = cdhit.cluster(&all, &seqs, params.sim, params.lengthdif)?;
        info!(
            "cd-hit: {} clusters over {} sequences (sim {}, lengthdif {})",
            table.len(),
            table.total_members(),
            params.sim,
            params.lengthdif
        );
    } else {
        fs::copy(&all, &seqs).context("Failed to copy allsequences.fa to sequences.fa")?;
        info!("multiplexing off; search runs on the full sequence set");
    }

    Ok(())
}

fn run_fracfile(dir: &Path, params: &Params) -> Result<()> {
    let np = params.effective_np();
    let mut writers: Vec<BufWriter<File>> = Vec::with_capacity(np);
    for i in 1..=np {
        let path = dir.join(format!("fracfile-{}.fa", i));
        writers.push(BufWriter::new(File::create(&path).with_context(|| {
            format!("Failed to create {}", path.display())
        })?));
    }

    let mut count = 0usize;
    for record in FastaFile::open(dir.join("sequences.fa"))? {
        let record = record?;
        fasta::write_records(&mut writers[count % np], std::slice::from_ref(&record))?;
        count += 1;
    }
    for mut writer in writers {
        writer.flush()?;
    }

    info!("{} sequences split into {} search parts", count, np);
    Ok(())
}

fn run_cat(dir: &Path, params: &Params) -> Result<()> {
    let out_path = dir.join("blastfinal.tab");
    let mut out = BufWriter::with_capacity(4 * 1024 * 1024, File::create(&out_path)?);

    let np = params.effective_np();
    let mut missing = 0usize;
    for i in 1..=np {
        let part = dir.join(format!("blastout-{}.fa.tab", i));
        if !part.exists() {
            warn!("missing search output: {}", part.display());
            missing += 1;
            continue;
        }
        let mut file = File::open(&part)?;
        std::io::copy(&mut file, &mut out)?;
    }
    out.flush()?;
    drop(out);

    let size = fs::metadata(&out_path)?.len();
    if size == 0 {
        File::create(dir.join("blast.failed"))?;
        anyhow::bail!(
            "similarity search produced no hits ({} of {} parts missing)",
            missing,
            np
        );
    }

    info!(
        "concatenated {} parts into blastfinal.tab ({} bytes, {} missing)",
        np - missing,
        size,
        missing
    );
    Ok(())
}

fn run_reduce(dir: &Path, buffer_mb: usize) -> Result<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()
        .ok();

    let stats = reduce::reduce_file(&dir.join("blastfinal.tab"), &dir.join("1.out"), buffer_mb)?;
    info!(
        "reduced {} hits ({} self) to {} edges",
        stats.hits_in, stats.self_hits, stats.edges_out
    );
    Ok(())
}

fn run_demux(dir: &Path, params: &Params) -> Result<()> {
    if params.manual_cdhit.is_some() || !params.multiplex {
        info!("no multiplexing in this run; edge list kept as-is");
        return Ok(());
    }

    let one = dir.join("1.out");
    let mux = dir.join("mux.out");
    fs::rename(&one, &mux).context("Failed to set aside representative edge list")?;

    let table = cluster::parse_clstr_file(&cluster::clstr_path(&dir.join("sequences.fa")))?;
    let edges = reduce::read_edges(&mux)?;
    let edges_in = edges.len();

    if params.no_demux {
        let deduped = cluster::remove_dups(edges);
        info!(
            "no-demux: {} representative edges kept of {}",
            deduped.len(),
            edges_in
        );
        reduce::write_edges(&one, &deduped)?;
        attach_cluster_sizes(dir, params, &table)?;
    } else {
        let expanded = cluster::demux_edges(&edges, &table);
        info!(
            "demultiplexed {} representative edges into {}",
            edges_in,
            expanded.len()
        );
        reduce::write_edges(&one, &expanded)?;
    }

    Ok(())
}

/// Record each representative's cluster size as a node attribute.
fn attach_cluster_sizes(
    dir: &Path,
    params: &Params,
    table: &cluster::ClusterTable,
) -> Result<()> {
    let meta = dir.join(&params.meta_file);
    let mut annots = annot::read_annotations(&meta)?;

    let sizes: FxHashMap<String, usize> = table.sizes();
    for (rep, size) in sizes {
        let key = xgmml::parse_domain_id(&rep)
            .map(|(base, _, _)| base.to_string())
            .unwrap_or(rep);
        if let Some(attrs) = annots.attrs.get_mut(&key) {
            attrs.retain(|(k, _)| k != "Cluster_Size");
            attrs.push(("Cluster_Size".to_string(), size.to_string()));
            annot::sort_attrs(attrs);
        }
    }

    annot::write_annotations(&meta, &annots)
}

fn run_conv_ratio(dir: &Path, params: &Params) -> Result<()> {
    let Some(name) = &params.conv_ratio_file else {
        info!("no convergence ratio file requested");
        return Ok(());
    };

    let edges = reduce::read_edges(&dir.join("1.out"))?.len();
    let mut nodes = 0usize;
    for record in FastaFile::open(node_space(dir, params))? {
        record?;
        nodes += 1;
    }

    let ratio = if nodes > 1 {
        (2 * edges) as f64 / (nodes * (nodes - 1)) as f64
    } else {
        0.0
    };

    let mut out = BufWriter::new(File::create(dir.join(name))?);
    writeln!(out, "ConvergenceRatio\t{:.6}", ratio)?;
    writeln!(out, "EdgeCount\t{}", edges)?;
    writeln!(out, "NodeCount\t{}", nodes)?;
    out.flush()?;

    info!("convergence ratio {:.6} ({} edges, {} nodes)", ratio, edges, nodes);
    Ok(())
}

fn build_network(dir: &Path, params: &Params) -> Result<xgmml::NetworkOutcome> {
    let one = dir.join("1.out");
    if !one.exists() || fs::metadata(&one)?.len() == 0 {
        anyhow::bail!("edge list 1.out is missing or empty");
    }
    let edges = reduce::read_edges(&one)?;

    let mut nodes: Vec<String> = Vec::new();
    for record in FastaFile::open(node_space(dir, params))? {
        nodes.push(record?.id);
    }

    let annots = annot::read_annotations(&dir.join(&params.meta_file))?;
    let db_version = fs::read_to_string(dir.join("database_version"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    xgmml::write_network(
        &dir.join(&params.out),
        &params.job_id,
        db_version.as_deref(),
        &nodes,
        &annots,
        &edges,
        params.maxfull,
    )
}

/// The graph stage always leaves the completion marker behind on its own
/// exit; a data anomaly raises `graphs.failed` instead of failing the job.
fn run_xgmml(dir: &Path, params: &Params) -> Result<()> {
    match build_network(dir, params) {
        Ok(xgmml::NetworkOutcome::Written { nodes, edges }) => {
            info!("wrote {} with {} nodes, {} edges", params.out, nodes, edges);
        }
        Ok(xgmml::NetworkOutcome::TooLarge { edges }) => {
            info!(
                "edge count {} exceeds maxfull {}; notice file written instead",
                edges, params.maxfull
            );
        }
        Err(e) => {
            error!("network generation failed: {:#}", e);
            fs::write(dir.join("graphs.failed"), format!("{:#}\n", e))?;
        }
    }

    File::create(dir.join("1.out.completed"))?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let dir = &args.dir;

    match args.command {
        Cmd::Import => {
            let params = load_params(dir)?;
            let settings = load_settings(&args.config)?;
            select::run_import(dir, &params, &settings)
        }
        Cmd::Multiplex => {
            let params = load_params(dir)?;
            run_multiplex(dir, &params, &args.config)
        }
        Cmd::Fracfile => run_fracfile(dir, &load_params(dir)?),
        Cmd::Cat => run_cat(dir, &load_params(dir)?),
        Cmd::Reduce { buffer_mb } => run_reduce(dir, buffer_mb),
        Cmd::Demux => run_demux(dir, &load_params(dir)?),
        Cmd::ConvRatio => run_conv_ratio(dir, &load_params(dir)?),
        Cmd::Xgmml => run_xgmml(dir, &load_params(dir)?),
    }
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
