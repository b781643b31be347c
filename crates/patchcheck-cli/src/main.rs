//! patchcheck - patch verification CLI
//!
//! The `patchcheck` command checks that a patch makes its FAIL_TO_PASS tests
//! pass without breaking its PASS_TO_PASS tests.
//!
//! ## Commands
//!
//! - `validate`: evaluate input records and write verdicts and logs
//! - `cache ls`: list persisted layers
//! - `cache rm`: evict a layer by key digest
//! - `fingerprint`: show the dependency fingerprint of a source tree

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use patchcheck_core::reporting::{write_report_json, write_run_logs};
use patchcheck_core::{
    emit_batch_finished, init_tracing, ArtifactCache, BatchReport, Digest, EngineConfig,
    EvaluationRequest, Evaluator, FsCasStore, InputRecord, LocalBackend, RecipeBook, Verdict,
    VerdictEngine, METRICS,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Level};
use uuid::Uuid;

/// Exit code for usage and configuration errors.
const EXIT_USAGE: u8 = 2;

/// Exit code when a run started but could not publish its results.
const EXIT_FAILURE: u8 = 1;

/// Marks an error raised after evaluation began, so it is not reported as misuse.
#[derive(Debug)]
struct RunFailed;

impl std::fmt::Display for RunFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("validation run failed")
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<RunFailed>().is_some() {
        EXIT_FAILURE
    } else {
        EXIT_USAGE
    }
}

#[derive(Parser)]
#[command(name = "patchcheck")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Verify patches against their declared test sets", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate input records (JSON files or directories of them)
    Validate(ValidateArgs),

    /// Inspect or evict cached layers
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show the dependency fingerprint of a source tree
    Fingerprint {
        /// Source tree to scan for dependency manifests
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Recipes file; with --repo, also prints the recipe fingerprint
        #[arg(long)]
        recipes: Option<PathBuf>,

        /// Repository slug (`org/name`) whose recipe to fingerprint
        #[arg(long)]
        repo: Option<String>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List persisted foundation and environment layers
    Ls {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Evict a layer by its key digest
    Rm {
        /// Key digest as printed by `cache ls`
        digest: String,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// Engine configuration file (TOML)
    #[arg(short, long, env = "PATCHCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Root of the layer store
    #[arg(long)]
    cache_root: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct ValidateArgs {
    /// Input record files or directories containing `*.json` records
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    /// Recipes file (`[default]` plus `[repos."org/name"]`)
    #[arg(long)]
    recipes: Option<PathBuf>,

    /// Per-test timeout in seconds
    #[arg(long)]
    per_test_timeout: Option<u64>,

    /// Overall per-record timeout in seconds
    #[arg(long)]
    overall_timeout: Option<u64>,

    /// Records evaluated concurrently
    #[arg(long)]
    max_workers: Option<usize>,

    /// Layer builds run concurrently
    #[arg(long)]
    max_concurrent_builds: Option<usize>,

    /// Directory for per-record logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Stop starting new records after the first non-VALID verdict
    #[arg(long)]
    fail_fast: bool,

    /// Where to write report.json (default: inside the run log directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format for verdicts on stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let outcome = match cli.command {
        Commands::Validate(args) => cmd_validate(&args).await,
        Commands::Cache { action } => match action {
            CacheAction::Ls { config, format } => cmd_cache_ls(&config, format),
            CacheAction::Rm { digest, config } => cmd_cache_rm(&config, &digest),
        },
        Commands::Fingerprint {
            path,
            recipes,
            repo,
        } => cmd_fingerprint(&path, recipes.as_deref(), repo.as_deref()),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

// ========== Configuration ==========

/// Defaults, then the optional TOML file, then `PATCHCHECK_*`, then flags.
fn load_config(config: &ConfigArgs) -> Result<EngineConfig> {
    let mut engine = match &config.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::default(),
    };
    engine.apply_env()?;
    if let Some(root) = &config.cache_root {
        engine.cache_root = root.clone();
    }
    Ok(engine)
}

impl ValidateArgs {
    fn apply_to(&self, engine: &mut EngineConfig) {
        if let Some(path) = &self.recipes {
            engine.recipes = Some(path.clone());
        }
        if let Some(secs) = self.per_test_timeout {
            engine.per_test_timeout_secs = secs;
        }
        if let Some(secs) = self.overall_timeout {
            engine.overall_timeout_secs = secs;
        }
        if let Some(n) = self.max_workers {
            engine.max_workers = n;
        }
        if let Some(n) = self.max_concurrent_builds {
            engine.max_concurrent_builds = n;
        }
        if let Some(dir) = &self.log_dir {
            engine.log_dir = dir.clone();
        }
        if self.fail_fast {
            engine.continue_on_error = false;
        }
    }
}

fn load_recipes(engine: &EngineConfig) -> Result<RecipeBook> {
    match &engine.recipes {
        Some(path) => Ok(RecipeBook::from_toml_file(path)?),
        None => Ok(RecipeBook::default()),
    }
}

fn open_cache(engine: &EngineConfig) -> Result<ArtifactCache> {
    let store = FsCasStore::new(engine.cache_root.join("cas"))
        .with_context(|| format!("Failed to open layer store under {:?}", engine.cache_root))?;
    Ok(ArtifactCache::with_store(
        Arc::new(store),
        engine.max_concurrent_builds,
    ))
}

// ========== Input loading ==========

/// One input slot: either a request to evaluate or a verdict already known.
enum Loaded {
    Ready(Box<EvaluationRequest>),
    Unloadable(Verdict),
}

/// Expand files and directories into a sorted list of record files.
fn collect_input_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(path)
                .with_context(|| format!("Failed to read directory {:?}", path))?
            {
                let entry_path = entry?.path();
                if entry_path.is_file()
                    && entry_path.extension().and_then(|e| e.to_str()) == Some("json")
                {
                    found.push(entry_path);
                }
            }
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            bail!("Input not found: {:?}", path);
        }
    }
    if files.is_empty() {
        bail!("No input files found");
    }
    Ok(files)
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Load every record from every file. A file that cannot be read or parsed
/// yields one STRUCTURAL_ERROR verdict instead of aborting the batch.
fn load_records(files: &[PathBuf], recipes: &RecipeBook) -> Vec<Loaded> {
    let mut loaded = Vec::new();
    for path in files {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                loaded.push(Loaded::Unloadable(VerdictEngine::unloadable(
                    file_label(path),
                    format!("failed to read {}: {}", path.display(), err),
                )));
                continue;
            }
        };
        match InputRecord::parse_many(&text) {
            Ok(records) => {
                for record in records {
                    let recipe = recipes.recipe_for(&record.repo).clone();
                    loaded.push(Loaded::Ready(Box::new(EvaluationRequest::from_record(
                        record, recipe,
                    ))));
                }
            }
            Err(err) => {
                let id = InputRecord::salvage_instance_id(&text)
                    .unwrap_or_else(|| file_label(path));
                warn!(file = %path.display(), error = %err, "input record could not be loaded");
                loaded.push(Loaded::Unloadable(VerdictEngine::unloadable(
                    id,
                    format!("{}: {}", path.display(), err),
                )));
            }
        }
    }
    loaded
}

/// Evaluate the loadable slots and merge verdicts back in input order.
async fn evaluate_loaded<C>(evaluator: &Evaluator, loaded: Vec<Loaded>, cancel: C) -> Vec<Verdict>
where
    C: Future<Output = ()>,
{
    let mut requests = Vec::new();
    let mut slots = Vec::with_capacity(loaded.len());
    for item in loaded {
        match item {
            Loaded::Ready(request) => {
                requests.push(*request);
                slots.push(None);
            }
            Loaded::Unloadable(verdict) => {
                METRICS.inc_verdict(verdict.result);
                slots.push(Some(verdict));
            }
        }
    }

    let mut evaluated = evaluator
        .evaluate_batch_until(requests, cancel)
        .await
        .into_iter();
    slots
        .into_iter()
        .filter_map(|slot| slot.or_else(|| evaluated.next()))
        .collect()
}

// ========== Commands ==========

async fn cmd_validate(args: &ValidateArgs) -> Result<u8> {
    let mut engine = load_config(&args.config)?;
    args.apply_to(&mut engine);
    engine.validate()?;
    let recipes = load_recipes(&engine)?;
    let files = collect_input_files(&args.paths)?;

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let clock = Instant::now();
    info!(run_id = %run_id, files = files.len(), "starting validation run");

    let backend = LocalBackend::new(engine.cache_root.join("work"))
        .with_context(|| format!("Failed to prepare work directory under {:?}", engine.cache_root))?;
    if let Err(err) = backend.sweep_stale_contexts() {
        warn!(error = %err, "failed to sweep stale execution contexts");
    }
    let evaluator = Evaluator::from_config(&engine, Arc::new(backend))
        .context("Failed to open layer store")?;

    let loaded = load_records(&files, &recipes);
    let verdicts = evaluate_loaded(&evaluator, loaded, interrupted()).await;
    let report = BatchReport::new(run_id, started_at, Utc::now(), &verdicts);

    match args.format {
        OutputFormat::Text => print!("{}", render_verdicts(&report, &verdicts)),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report).context(RunFailed)?)
        }
    }

    let run_dir = write_run_logs(&engine.log_dir, &run_id, &verdicts).context(RunFailed)?;
    let report_path = args
        .output
        .clone()
        .unwrap_or_else(|| run_dir.join("report.json"));
    write_report_json(&report_path, &report).context(RunFailed)?;
    info!(path = %report_path.display(), "wrote batch report");

    emit_batch_finished(
        &run_id.to_string(),
        report.summary.total,
        report.summary.valid,
        clock.elapsed().as_millis() as u64,
    );
    METRICS.flush();

    Ok(report.exit_code() as u8)
}

/// One line per record, diagnostics indented below, then a summary line.
/// Completes on Ctrl-C. Child commands run in their own process groups, so
/// the terminal's SIGINT no longer reaches them directly.
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("interrupted, cancelling records in flight"),
        Err(err) => {
            warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await
        }
    }
}

fn render_verdicts(report: &BatchReport, verdicts: &[Verdict]) -> String {
    let mut out = String::new();
    for verdict in verdicts {
        let mark = if verdict.is_valid() { "✓" } else { "✗" };
        out.push_str(&format!("{} {}: {}\n", mark, verdict.request_id, verdict.result));
        if !verdict.is_valid() {
            for line in &verdict.diagnostics {
                let first = line.lines().next().unwrap_or_default();
                out.push_str(&format!("    {}\n", first));
            }
        }
    }
    let s = &report.summary;
    out.push_str(&format!(
        "\nSummary: {}/{} valid ({} invalid, {} structural errors, {} execution errors)\n",
        s.valid, s.total, s.invalid, s.structural_error, s.execution_error
    ));
    out
}

fn cmd_cache_ls(config: &ConfigArgs, format: OutputFormat) -> Result<u8> {
    let engine = load_config(config)?;
    let cache = open_cache(&engine)?;
    let mut artifacts = cache
        .persisted_artifacts()
        .context("Failed to read persisted layers")?;
    artifacts.sort_by_key(|a| (a.key.kind().as_str(), a.key.label()));

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&artifacts)?);
        return Ok(0);
    }

    if artifacts.is_empty() {
        println!("No cached layers under {:?}", engine.cache_root);
        return Ok(0);
    }
    for artifact in &artifacts {
        println!(
            "{}  {:<11}  {}  built {}",
            artifact.key.digest(),
            artifact.key.kind().as_str(),
            artifact.key.label(),
            artifact.built_at.to_rfc3339()
        );
    }
    println!("\n{} layer(s)", artifacts.len());
    Ok(0)
}

fn cmd_cache_rm(config: &ConfigArgs, digest: &str) -> Result<u8> {
    let engine = load_config(config)?;
    let digest = Digest::from_str(digest.trim())
        .with_context(|| format!("Not a key digest: {}", digest))?;
    let cache = open_cache(&engine)?;

    let evicted = cache
        .evict_by_digest(&digest)
        .context("Failed to evict layer")?;
    let pruned = cache.prune_manifests().context("Failed to prune manifests")?;
    info!(pruned, "pruned unreferenced manifests");
    let work = engine.cache_root.join("work");
    let discarded = if work.is_dir() {
        LocalBackend::new(&work)?.discard_layer(&digest)?
    } else {
        false
    };

    if evicted || discarded {
        println!("Evicted {}", digest.short());
        Ok(0)
    } else {
        println!("No cached layer with key digest {}", digest.short());
        Ok(1)
    }
}

fn cmd_fingerprint(path: &Path, recipes: Option<&Path>, repo: Option<&str>) -> Result<u8> {
    let manifests = env_fingerprint::fingerprint_manifests(path)
        .with_context(|| format!("Failed to fingerprint {:?}", path))?;

    println!("Manifest Fingerprint: {}", manifests.fingerprint.hash);
    println!("Source: {:?}", manifests.fingerprint.source);
    println!("Short: {}", manifests.fingerprint.short());
    for file in &manifests.files {
        println!("  {}", file);
    }

    if let Some(repo) = repo {
        let book = match recipes {
            Some(p) => RecipeBook::from_toml_file(p)?,
            None => RecipeBook::default(),
        };
        let recipe = book.recipe_for(repo);
        let fingerprint = recipe
            .fingerprint()
            .with_context(|| format!("Failed to fingerprint recipe for {}", repo))?;
        println!("Recipe Fingerprint ({}): {}", repo, fingerprint.hash);
    }
    Ok(0)
}
