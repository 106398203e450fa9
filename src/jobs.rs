//! Pipeline DAG construction and batch submission.
//!
//! The orchestrator renders one batch script per stage, submits them in
//! dependency order and exits; the scheduler owns execution. The stage
//! graph is fixed:
//!
//! ```text
//! import -> multiplex -> fracfile -> createdb -> blast[1..np]
//!                                                    |  (afterany fan-in)
//!                                                  cat -> reduce -> demux -> {conv_ratio?, graphs}
//! ```
//!
//! Stages communicate only through files in the working directory; the
//! failure sentinels (`blast.failed`, `graphs.failed`) and the success
//! marker (`1.out.completed`) are the cross-process state and stay that
//! way, wrapped behind the `StageStatus` accessor.

use anyhow::{Context, Result};
use log::info;
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{Params, SearchTool};

/// Supported cluster schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Torque,
    Slurm,
}

impl SchedulerKind {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "torque" => Ok(SchedulerKind::Torque),
            "slurm" => Ok(SchedulerKind::Slurm),
            other => Err(format!("Unknown scheduler '{}'. Use torque or slurm.", other)),
        }
    }

    fn submit_command(&self) -> &'static str {
        match self {
            SchedulerKind::Torque => "qsub",
            SchedulerKind::Slurm => "sbatch",
        }
    }

    fn array_variable(&self) -> &'static str {
        match self {
            SchedulerKind::Torque => "PBS_ARRAYID",
            SchedulerKind::Slurm => "SLURM_ARRAY_TASK_ID",
        }
    }
}

/// Find an executable on PATH.
fn find_executable(name: &str) -> Option<PathBuf> {
    let paths = env::var("PATH").ok()?;
    for dir in env::split_paths(&paths) {
        let full = dir.join(name);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

/// Probe PATH for a scheduler; Slurm wins when both are present, and is
/// also the fallback for pure dry runs on machines with neither.
pub fn detect_scheduler() -> SchedulerKind {
    if find_executable("sbatch").is_some() {
        SchedulerKind::Slurm
    } else if find_executable("qsub").is_some() {
        SchedulerKind::Torque
    } else {
        SchedulerKind::Slurm
    }
}

/// Dependency kind between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    AfterOk,
    AfterAny,
}

impl DepKind {
    fn keyword(&self) -> &'static str {
        match self {
            DepKind::AfterOk => "afterok",
            DepKind::AfterAny => "afterany",
        }
    }
}

/// Orchestrator-side stage lifecycle. `Completed`/`Failed` are only ever
/// observed through the on-disk sentinels after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Submitted,
    Completed,
    Failed,
    Skipped,
}

/// One renderable stage of the pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: &'static str,
    pub body: String,
    pub queue: String,
    /// Indices into the stage list, resolved to job IDs at submit time.
    pub deps: Vec<(usize, DepKind)>,
    /// Array fan-out `1..=n`.
    pub array: Option<usize>,
    pub cpus: usize,
    pub mem_gb: usize,
    pub walltime_hours: usize,
    pub mail_on_end: bool,
}

/// Render the batch script for one stage.
pub fn render_script(
    kind: SchedulerKind,
    job_name: &str,
    spec: &StageSpec,
    dep_ids: &[(String, DepKind)],
) -> String {
    let mut script = String::with_capacity(512);
    script.push_str("#!/bin/bash\n");

    match kind {
        SchedulerKind::Torque => {
            script.push_str(&format!("#PBS -N {}\n", job_name));
            script.push_str(&format!("#PBS -q {}\n", spec.queue));
            script.push_str(&format!("#PBS -l nodes=1:ppn={}\n", spec.cpus));
            script.push_str(&format!("#PBS -l mem={}gb\n", spec.mem_gb));
            script.push_str(&format!("#PBS -l walltime={}:00:00\n", spec.walltime_hours));
            script.push_str("#PBS -j oe\n");
            if let Some(n) = spec.array {
                script.push_str(&format!("#PBS -t 1-{}\n", n));
            }
            if !dep_ids.is_empty() {
                let clauses: Vec<String> = dep_ids
                    .iter()
                    .map(|(id, dep)| format!("{}:{}", dep.keyword(), id))
                    .collect();
                script.push_str(&format!("#PBS -W depend={}\n", clauses.join(",")));
            }
            if spec.mail_on_end {
                script.push_str("#PBS -m e\n");
            }
            script.push_str("cd \"$PBS_O_WORKDIR\"\n");
        }
        SchedulerKind::Slurm => {
            script.push_str(&format!("#SBATCH --job-name={}\n", job_name));
            script.push_str(&format!("#SBATCH --partition={}\n", spec.queue));
            script.push_str("#SBATCH --nodes=1\n");
            script.push_str(&format!("#SBATCH --cpus-per-task={}\n", spec.cpus));
            script.push_str(&format!("#SBATCH --mem={}G\n", spec.mem_gb));
            script.push_str(&format!("#SBATCH --time={}:00:00\n", spec.walltime_hours));
            if let Some(n) = spec.array {
                script.push_str(&format!("#SBATCH --array=1-{}\n", n));
            }
            if !dep_ids.is_empty() {
                let clauses: Vec<String> = dep_ids
                    .iter()
                    .map(|(id, dep)| format!("{}:{}", dep.keyword(), id))
                    .collect();
                script.push_str(&format!("#SBATCH --dependency={}\n", clauses.join(",")));
            }
            if spec.mail_on_end {
                script.push_str("#SBATCH --mail-type=END\n");
            }
        }
    }

    if spec.array.is_some() {
        script.push_str(&format!("IDX=${{{}}}\n", kind.array_variable()));
    }
    script.push_str(&spec.body);
    if !spec.body.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Parse the scheduler's submit output into a job ID.
pub fn parse_job_id(kind: SchedulerKind, stdout: &str) -> Result<String> {
    let id = match kind {
        // qsub prints the bare id, e.g. `12345.headnode`
        SchedulerKind::Torque => stdout.trim().lines().next().unwrap_or("").trim().to_string(),
        // sbatch prints `Submitted batch job 12345`
        SchedulerKind::Slurm => stdout
            .trim()
            .split_whitespace()
            .next_back()
            .unwrap_or("")
            .to_string(),
    };

    if id.is_empty() {
        anyhow::bail!("Scheduler returned no job id (output: '{}')", stdout.trim());
    }
    Ok(id)
}

/// Capability seam over job submission so the graph can be exercised
/// without a scheduler.
pub trait Submitter {
    fn submit(&mut self, script: &Path, name: &str) -> Result<String>;
}

/// Real submission through `qsub`/`sbatch`.
pub struct CmdSubmitter {
    kind: SchedulerKind,
}

impl CmdSubmitter {
    pub fn new(kind: SchedulerKind) -> Self {
        Self { kind }
    }
}

impl Submitter for CmdSubmitter {
    fn submit(&mut self, script: &Path, name: &str) -> Result<String> {
        let output = Command::new(self.kind.submit_command())
            .arg(script)
            .output()
            .with_context(|| format!("Failed to run {}", self.kind.submit_command()))?;

        if !output.status.success() {
            anyhow::bail!(
                "Submission of stage '{}' refused: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_job_id(self.kind, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Dry-run submitter: scripts are rendered and written, dependencies are
/// tracked against synthesized IDs.
#[derive(Default)]
pub struct DryRunSubmitter {
    next: usize,
    pub submitted: Vec<(String, String)>,
}

impl Submitter for DryRunSubmitter {
    fn submit(&mut self, _script: &Path, name: &str) -> Result<String> {
        self.next += 1;
        let id = format!("dryrun-{}", self.next);
        self.submitted.push((name.to_string(), id.clone()));
        Ok(id)
    }
}

/// One submitted stage.
#[derive(Debug, Clone)]
pub struct SubmittedStage {
    pub name: &'static str,
    pub job_id: String,
    pub state: StageState,
}

/// Requests above these are unschedulable on most clusters; a wildly
/// over-estimated run is still better submitted than rejected.
const MAX_MEM_GB: usize = 512;
const MAX_WALLTIME_HOURS: usize = 336;

/// Per-stage memory and walltime estimates, scaled from the expected
/// search-set size (`select::estimate_input_size` at submission time).
/// Each stage has a floor that covers small runs; growth is linear in
/// the sequence count except for the search itself, which grows with
/// the pair count per array task.
#[derive(Debug, Clone, Copy)]
pub struct ResourcePlan {
    seq_count: usize,
}

impl ResourcePlan {
    pub fn new(seq_count: usize) -> Self {
        Self {
            seq_count: seq_count.max(1),
        }
    }

    fn mem(&self, floor: usize, seqs_per_gb: usize) -> usize {
        (floor + self.seq_count / seqs_per_gb).min(MAX_MEM_GB)
    }

    fn hours(&self, floor: usize, seqs_per_hour: usize) -> usize {
        (floor + self.seq_count / seqs_per_hour).min(MAX_WALLTIME_HOURS)
    }

    /// (mem_gb, walltime_hours) per stage.
    pub fn import(&self) -> (usize, usize) {
        (self.mem(4, 25_000), self.hours(2, 100_000))
    }

    pub fn multiplex(&self) -> (usize, usize) {
        (self.mem(4, 10_000), self.hours(2, 25_000))
    }

    pub fn fracfile(&self) -> (usize, usize) {
        (self.mem(4, 100_000), self.hours(1, 200_000))
    }

    pub fn createdb(&self) -> (usize, usize) {
        (self.mem(4, 50_000), self.hours(1, 200_000))
    }

    pub fn blast(&self, np: usize) -> (usize, usize) {
        let pairs_per_task = self.seq_count.saturating_mul(self.seq_count) / np.max(1);
        let hours = (4 + pairs_per_task / 50_000_000).min(MAX_WALLTIME_HOURS);
        (self.mem(8, 25_000), hours)
    }

    pub fn catjob(&self) -> (usize, usize) {
        (self.mem(4, 100_000), self.hours(2, 200_000))
    }

    pub fn reduce(&self) -> (usize, usize) {
        (self.mem(16, 5_000), self.hours(4, 25_000))
    }

    pub fn demux(&self) -> (usize, usize) {
        (self.mem(8, 10_000), self.hours(2, 50_000))
    }

    pub fn conv_ratio(&self) -> (usize, usize) {
        (self.mem(4, 100_000), self.hours(1, 200_000))
    }

    pub fn graphs(&self) -> (usize, usize) {
        (self.mem(16, 5_000), self.hours(4, 25_000))
    }
}

/// Build the full stage list for one run. `seq_count` is the
/// submission-time size estimate driving the resource requests.
pub fn build_pipeline(
    params: &Params,
    workdir: &Path,
    config_path: &Path,
    seq_count: usize,
) -> Vec<StageSpec> {
    let wd = workdir.display();
    let cfg = config_path.display();
    let np = params.effective_np();
    let plan = ResourcePlan::new(seq_count);

    let worker = format!("ssnet-stage --dir {} --config {}", wd, cfg);

    let mut stages: Vec<StageSpec> = Vec::new();

    // import: selection core, runs inside the cluster like everything else
    let (mem_gb, walltime_hours) = plan.import();
    stages.push(StageSpec {
        name: "import",
        body: format!("{} import\n", worker),
        queue: params.queue.clone(),
        deps: vec![],
        array: None,
        cpus: 1,
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    // multiplex: cd-hit (or passthrough / manual table)
    let (mem_gb, walltime_hours) = plan.multiplex();
    stages.push(StageSpec {
        name: "multiplex",
        body: format!("{} multiplex\n", worker),
        queue: params.queue.clone(),
        deps: vec![(0, DepKind::AfterOk)],
        array: None,
        cpus: 1,
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    let (mem_gb, walltime_hours) = plan.fracfile();
    stages.push(StageSpec {
        name: "fracfile",
        body: format!("{} fracfile\n", worker),
        queue: params.queue.clone(),
        deps: vec![(1, DepKind::AfterOk)],
        array: None,
        cpus: 1,
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    let (mem_gb, walltime_hours) = plan.createdb();
    stages.push(StageSpec {
        name: "createdb",
        body: format!("{}\n", createdb_command(params.blast, workdir)),
        queue: params.queue.clone(),
        deps: vec![(2, DepKind::AfterOk)],
        array: None,
        cpus: 1,
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    // blast fan-out; tool failure or empty input raises the sentinel early
    let (mem_gb, walltime_hours) = plan.blast(np);
    stages.push(StageSpec {
        name: "blast",
        body: format!(
            "{cmd} || {{ touch {wd}/blast.failed; exit 1; }}\n",
            cmd = search_command(params, workdir),
            wd = wd
        ),
        queue: params.queue.clone(),
        deps: vec![(3, DepKind::AfterOk)],
        array: Some(np),
        cpus: if params.blast.is_diamond() { 24 } else { 1 },
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    // fan-in waits for every array element, successful or not
    let (mem_gb, walltime_hours) = plan.catjob();
    stages.push(StageSpec {
        name: "catjob",
        body: format!("{} cat\n", worker),
        queue: params.queue.clone(),
        deps: vec![(4, DepKind::AfterAny)],
        array: None,
        cpus: 1,
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    let (mem_gb, walltime_hours) = plan.reduce();
    stages.push(StageSpec {
        name: "blastreduce",
        body: format!("{} reduce\n", worker),
        queue: params.memqueue.clone(),
        deps: vec![(5, DepKind::AfterOk)],
        array: None,
        cpus: 4,
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    let (mem_gb, walltime_hours) = plan.demux();
    stages.push(StageSpec {
        name: "demux",
        body: format!("{} demux\n", worker),
        queue: params.memqueue.clone(),
        deps: vec![(6, DepKind::AfterOk)],
        array: None,
        cpus: 1,
        mem_gb,
        walltime_hours,
        mail_on_end: false,
    });

    if params.conv_ratio_file.is_some() {
        let (mem_gb, walltime_hours) = plan.conv_ratio();
        stages.push(StageSpec {
            name: "conv_ratio",
            body: format!("{} conv-ratio\n", worker),
            queue: params.queue.clone(),
            deps: vec![(7, DepKind::AfterOk)],
            array: None,
            cpus: 1,
            mem_gb,
            walltime_hours,
            mail_on_end: false,
        });
    }

    let (mem_gb, walltime_hours) = plan.graphs();
    stages.push(StageSpec {
        name: "graphs",
        body: format!("{} xgmml\n", worker),
        queue: params.memqueue.clone(),
        deps: vec![(7, DepKind::AfterOk)],
        array: None,
        cpus: 1,
        mem_gb,
        walltime_hours,
        mail_on_end: true,
    });

    stages
}

/// The similarity search command for one array task.
pub fn search_command(params: &Params, workdir: &Path) -> String {
    let wd = workdir.display();
    let frac = format!("{}/fracfile-$IDX.fa", wd);
    let out = format!("{}/blastout-$IDX.fa.tab", wd);
    let db = format!("{}/database", wd);
    let long_fmt = "qseqid sseqid pident length mismatch gapopen qstart qend sstart send evalue bitscore qlen slen";

    match params.blast {
        SearchTool::Blast => format!(
            "blastall -p blastp -i {frac} -d {db} -m 8 -e {ev} -b {hits} -v {hits} -o {out}",
            frac = frac,
            db = db,
            ev = params.evalue,
            hits = params.blasthits,
            out = out
        ),
        SearchTool::BlastPlus => format!(
            "blastp -query {frac} -db {db} -outfmt \"6 {fmt}\" -evalue {ev} -max_target_seqs {hits} -out {out}",
            frac = frac,
            db = db,
            fmt = long_fmt,
            ev = params.evalue,
            hits = params.blasthits,
            out = out
        ),
        SearchTool::BlastPlusSimple => format!(
            "blastp -query {frac} -db {db} -outfmt 6 -evalue {ev} -max_target_seqs {hits} -out {out}",
            frac = frac,
            db = db,
            ev = params.evalue,
            hits = params.blasthits,
            out = out
        ),
        SearchTool::Diamond => format!(
            "diamond blastp --query {frac} --db {db} --outfmt 6 {fmt} --evalue {ev} --max-target-seqs {hits} --out {out}",
            frac = frac,
            db = db,
            fmt = long_fmt,
            ev = params.evalue,
            hits = params.blasthits,
            out = out
        ),
        SearchTool::DiamondSensitive => format!(
            "diamond blastp --sensitive --query {frac} --db {db} --outfmt 6 {fmt} --evalue {ev} --max-target-seqs {hits} --out {out}",
            frac = frac,
            db = db,
            fmt = long_fmt,
            ev = params.evalue,
            hits = params.blasthits,
            out = out
        ),
    }
}

/// The database-formatting command matching the search tool.
pub fn createdb_command(tool: SearchTool, workdir: &Path) -> String {
    let wd = workdir.display();
    match tool {
        SearchTool::Blast => format!("formatdb -i {}/sequences.fa -n {}/database -p T -o T", wd, wd),
        SearchTool::BlastPlus | SearchTool::BlastPlusSimple => format!(
            "makeblastdb -in {}/sequences.fa -out {}/database -dbtype prot",
            wd, wd
        ),
        SearchTool::Diamond | SearchTool::DiamondSensitive => format!(
            "diamond makedb --in {}/sequences.fa -d {}/database",
            wd, wd
        ),
    }
}

/// Render, write and submit every stage in dependency order.
pub fn submit_pipeline(
    kind: SchedulerKind,
    workdir: &Path,
    job_prefix: &str,
    stages: &[StageSpec],
    submitter: &mut dyn Submitter,
) -> Result<Vec<SubmittedStage>> {
    let mut submitted: Vec<SubmittedStage> = Vec::with_capacity(stages.len());

    for spec in stages {
        let dep_ids: Vec<(String, DepKind)> = spec
            .deps
            .iter()
            .map(|(idx, dep)| {
                submitted
                    .get(*idx)
                    .map(|s: &SubmittedStage| (s.job_id.clone(), *dep))
                    .ok_or_else(|| {
                        anyhow::anyhow!("Stage '{}' depends on unsubmitted stage {}", spec.name, idx)
                    })
            })
            .collect::<Result<_>>()?;

        let job_name = format!("{}_{}", job_prefix, spec.name);
        let script = render_script(kind, &job_name, spec, &dep_ids);
        let script_path = workdir.join(format!("{}.sh", spec.name));
        let mut file = File::create(&script_path)
            .with_context(|| format!("Failed to write script: {}", script_path.display()))?;
        file.write_all(script.as_bytes())?;

        let job_id = submitter.submit(&script_path, spec.name)?;
        info!("submitted {} as {}", spec.name, job_id);
        submitted.push(SubmittedStage {
            name: spec.name,
            job_id,
            state: StageState::Submitted,
        });
    }

    Ok(submitted)
}

/// Sentinel-file view of a working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStatus {
    pub blast_failed: bool,
    pub graphs_failed: bool,
    pub completed: bool,
}

impl StageStatus {
    /// Read the cross-process sentinels. `1.out.completed` is the single
    /// success marker; failure sentinels may coexist with it.
    pub fn read(workdir: &Path) -> Self {
        Self {
            blast_failed: workdir.join("blast.failed").exists(),
            graphs_failed: workdir.join("graphs.failed").exists(),
            completed: workdir.join("1.out.completed").exists(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{family_list, FamilyKind, InputSource};

    fn params() -> Params {
        Params {
            job_id: "job7".to_string(),
            source: InputSource::Families(family_list(FamilyKind::Pfam, "PF00001")),
            domain: false,
            fraction: 1,
            random_fraction: false,
            maxsequence: 0,
            minlen: 0,
            maxlen: 0,
            evalue: "1e-5".to_string(),
            multiplex: true,
            sim: 1.0,
            lengthdif: 1.0,
            manual_cdhit: None,
            no_demux: false,
            unverified: false,
            blast: SearchTool::BlastPlus,
            blasthits: 250,
            np: 8,
            maxfull: 0,
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
    fn test_render_torque_script() {
        let spec = StageSpec {
            name: "blast",
            body: "blastp ...".to_string(),
            queue: "normal".to_string(),
            deps: vec![],
            array: Some(8),
            cpus: 1,
            mem_gb: 16,
            walltime_hours: 48,
            mail_on_end: false,
        };
        let deps = vec![("101.head".to_string(), DepKind::AfterOk)];
        let script = render_script(SchedulerKind::Torque, "job7_blast", &spec, &deps);

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#PBS -N job7_blast"));
        assert!(script.contains("#PBS -q normal"));
        assert!(script.contains("#PBS -t 1-8"));
        assert!(script.contains("#PBS -W depend=afterok:101.head"));
        assert!(script.contains("IDX=${PBS_ARRAYID}"));
    }

    #[test]
    fn test_render_slurm_script_with_afterany_and_mail() {
        let spec = StageSpec {
            name: "catjob",
            body: "ssnet-stage cat".to_string(),
            queue: "mem".to_string(),
            deps: vec![],
            array: None,
            cpus: 1,
            mem_gb: 4,
            walltime_hours: 8,
            mail_on_end: true,
        };
        let deps = vec![("202".to_string(), DepKind::AfterAny)];
        let script = render_script(SchedulerKind::Slurm, "job7_catjob", &spec, &deps);

        assert!(script.contains("#SBATCH --job-name=job7_catjob"));
        assert!(script.contains("#SBATCH --partition=mem"));
        assert!(script.contains("#SBATCH --dependency=afterany:202"));
        assert!(script.contains("#SBATCH --mail-type=END"));
        assert!(!script.contains("--array"));
    }

    #[test]
    fn test_parse_job_ids() {
        assert_eq!(
            parse_job_id(SchedulerKind::Torque, "12345.headnode\n").unwrap(),
            "12345.headnode"
        );
        assert_eq!(
            parse_job_id(SchedulerKind::Slurm, "Submitted batch job 6789\n").unwrap(),
            "6789"
        );
        assert!(parse_job_id(SchedulerKind::Slurm, "").is_err());
    }

    #[test]
    fn test_pipeline_shape() {
        let p = params();
        let stages = build_pipeline(&p, Path::new("/wd"), Path::new("/cfg.json"), 10_000);

        let names: Vec<&str> = stages.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "import",
                "multiplex",
                "fracfile",
                "createdb",
                "blast",
                "catjob",
                "blastreduce",
                "demux",
                "graphs"
            ]
        );

        let blast = &stages[4];
        assert_eq!(blast.array, Some(8));
        assert!(blast.body.contains("blastout-$IDX.fa.tab"));
        assert!(blast.body.contains("blast.failed"));

        // fan-in waits for every array element
        let cat = &stages[5];
        assert_eq!(cat.deps, vec![(4, DepKind::AfterAny)]);

        // final stage notifies by mail
        assert!(stages.last().unwrap().mail_on_end);
    }

    #[test]
    fn test_resource_plan_floors_and_caps() {
        let tiny = ResourcePlan::new(0);
        assert_eq!(tiny.import(), (4, 2));
        assert_eq!(tiny.reduce(), (16, 4));
        assert_eq!(tiny.blast(48), (8, 4));

        let huge = ResourcePlan::new(100_000_000);
        let (mem, hours) = huge.reduce();
        assert_eq!(mem, MAX_MEM_GB);
        assert_eq!(hours, MAX_WALLTIME_HOURS);
        assert_eq!(huge.blast(48).1, MAX_WALLTIME_HOURS);
    }

    #[test]
    fn test_resource_plan_scales_with_sequences() {
        let small = ResourcePlan::new(5_000);
        let large = ResourcePlan::new(500_000);

        assert!(large.import().0 > small.import().0);
        assert!(large.multiplex().1 > small.multiplex().1);
        assert!(large.reduce().0 > small.reduce().0);
        assert!(large.blast(48).1 > small.blast(48).1);
        assert!(large.graphs().0 > small.graphs().0);
    }

    #[test]
    fn test_pipeline_resources_follow_estimate() {
        let p = params();
        let small = build_pipeline(&p, Path::new("/wd"), Path::new("/cfg.json"), 1_000);
        let large = build_pipeline(&p, Path::new("/wd"), Path::new("/cfg.json"), 1_000_000);

        for (s, l) in small.iter().zip(&large) {
            assert!(l.mem_gb >= s.mem_gb, "{}", s.name);
            assert!(l.walltime_hours >= s.walltime_hours, "{}", s.name);
        }

        let reduce_small = small.iter().find(|s| s.name == "blastreduce").unwrap();
        let reduce_large = large.iter().find(|s| s.name == "blastreduce").unwrap();
        assert!(reduce_large.mem_gb > reduce_small.mem_gb);

        // the rendered headers carry the scaled request
        let spec = large.iter().find(|s| s.name == "blastreduce").unwrap();
        let script = render_script(SchedulerKind::Slurm, "job7_blastreduce", spec, &[]);
        assert!(script.contains(&format!("#SBATCH --mem={}G", spec.mem_gb)));
        assert!(script.contains(&format!("#SBATCH --time={}:00:00", spec.walltime_hours)));
    }

    #[test]
    fn test_pipeline_diamond_rescale_and_conv_ratio() {
        let mut p = params();
        p.blast = SearchTool::Diamond;
        p.np = 48;
        p.conv_ratio_file = Some("conv_ratio.txt".to_string());
        let stages = build_pipeline(&p, Path::new("/wd"), Path::new("/cfg.json"), 10_000);

        let blast = stages.iter().find(|s| s.name == "blast").unwrap();
        assert_eq!(blast.array, Some(2));
        assert_eq!(blast.cpus, 24);
        assert!(stages.iter().any(|s| s.name == "conv_ratio"));
    }

    #[test]
    fn test_search_commands() {
        let mut p = params();
        let wd = Path::new("/wd");

        let cmd = search_command(&p, wd);
        assert!(cmd.starts_with("blastp -query"));
        assert!(cmd.contains("qlen slen"));
        assert!(cmd.contains("-evalue 1e-5"));

        p.blast = SearchTool::Blast;
        assert!(search_command(&p, wd).starts_with("blastall -p blastp"));

        p.blast = SearchTool::DiamondSensitive;
        let cmd = search_command(&p, wd);
        assert!(cmd.contains("--sensitive"));
        assert!(cmd.contains("--max-target-seqs 250"));
    }

    #[test]
    fn test_submit_pipeline_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let p = params();
        let stages = build_pipeline(&p, dir.path(), Path::new("/cfg.json"), 10_000);

        let mut submitter = DryRunSubmitter::default();
        let submitted =
            submit_pipeline(SchedulerKind::Slurm, dir.path(), "job7", &stages, &mut submitter)
                .unwrap();

        assert_eq!(submitted.len(), stages.len());
        assert!(submitted.iter().all(|s| s.state == StageState::Submitted));

        // Every script was rendered to disk even though nothing ran.
        for spec in &stages {
            assert!(dir.path().join(format!("{}.sh", spec.name)).exists());
        }

        // The reduce stage depends on the cat stage's synthesized id.
        let reduce_script =
            std::fs::read_to_string(dir.path().join("blastreduce.sh")).unwrap();
        let cat_id = &submitted[5].job_id;
        assert!(reduce_script.contains(&format!("afterok:{}", cat_id)));
    }

    #[test]
    fn test_stage_status_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let status = StageStatus::read(dir.path());
        assert!(!status.completed && !status.blast_failed && !status.graphs_failed);

        std::fs::write(dir.path().join("blast.failed"), "").unwrap();
        std::fs::write(dir.path().join("1.out.completed"), "").unwrap();
        let status = StageStatus::read(dir.path());
        assert!(status.completed);
        assert!(status.blast_failed);
    }
}
