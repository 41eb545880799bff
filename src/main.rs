use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use profile_ledger::batch::{
    BatchEngine, BatchJob, BatchJobStatus, EventInput, JobRun, JobType, PlayCountScorer,
    ProgressHub, ProgressObserver, ProgressSnapshot, StopHandle,
};
use profile_ledger::config::{AppConfig, CliConfig, FileConfig};
use profile_ledger::enrichment::build_provider;
use profile_ledger::entity_store::{DerivedRecord, SortOrder};
use profile_ledger::{AlgorithmVersion, ItemId, Ledger, RollupKind};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "profile-ledger", version, about)]
struct CliArgs {
    /// Path to the SQLite ledger database file.
    #[clap(long = "db", global = true, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to a TOML config file. Values in the file override flags.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Last.fm API key, enables tag enrichment.
    #[clap(long, global = true)]
    pub lastfm_api_key: Option<String>,

    /// Number of items scored and written per transaction.
    #[clap(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Minimum number of items between two checkpoints.
    #[clap(long, global = true)]
    pub checkpoint_every: Option<usize>,

    /// Threads of the scoring pool.
    #[clap(long, global = true)]
    pub scoring_workers: Option<usize>,

    /// Fail the whole job on the first item failure.
    #[clap(long, global = true)]
    pub strict: bool,

    /// Count enrichment failures as item failures.
    #[clap(long, global = true)]
    pub strict_enrichment: bool,

    /// Size of the top and bottom lists in global statistics.
    #[clap(long, global = true)]
    pub top_n: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage algorithm versions.
    Versions {
        #[command(subcommand)]
        action: VersionsCommand,
    },

    /// Ingests listening events, one JSON object per line.
    /// Reads stdin when no file is given.
    Ingest {
        #[clap(value_parser = parse_path)]
        input: Option<PathBuf>,
    },

    /// Resumes a paused ingest or recompute job. Ingest jobs need the same
    /// input they were started with.
    Resume {
        job_id: String,
        #[clap(value_parser = parse_path)]
        input: Option<PathBuf>,
    },

    /// Re-scores every record not computed with the active version.
    Recompute,

    /// Lists recent jobs, or shows one job with its error sample.
    Jobs {
        job_id: Option<String>,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Rebuilds all profiles, or one profile when a key is given.
    Rollup {
        /// group, tag or period.
        #[clap(long, default_value = "group")]
        kind: String,
        #[clap(long)]
        key: Option<String>,
        /// Lists stored profiles instead of rebuilding them.
        #[clap(long)]
        show: bool,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Shows global statistics, refreshing them when asked or never computed.
    Stats {
        #[clap(long)]
        refresh: bool,
    },

    /// Queries derived records.
    Query {
        #[command(subcommand)]
        query: QueryCommand,
    },

    /// Writes a JSON snapshot of the whole ledger. Writes stdout when no file
    /// is given.
    Export {
        #[clap(value_parser = parse_path)]
        output: Option<PathBuf>,
    },

    /// Loads a JSON snapshot produced by `export`.
    Import {
        #[clap(value_parser = parse_path)]
        input: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum VersionsCommand {
    /// Registers a version, or updates its label.
    Register {
        version_id: String,
        #[clap(long, default_value = "")]
        label: String,
        /// Makes this the active version, deactivating the current one.
        #[clap(long)]
        activate: bool,
    },
    /// Lists all versions, oldest first.
    List,
    /// Shows the active version.
    Active,
}

#[derive(Subcommand, Debug)]
enum QueryCommand {
    /// Records with a score in [min, max].
    Score {
        min: f64,
        max: f64,
        #[clap(long)]
        asc: bool,
    },
    /// Records with a computed field in [min, max].
    Field {
        field: String,
        min: f64,
        max: f64,
        #[clap(long)]
        asc: bool,
    },
    /// Records computed between two unix timestamps.
    Time { start: i64, end: i64 },
    /// Records of one group, or of every group starting with a prefix.
    Group {
        key: String,
        #[clap(long)]
        prefix: bool,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
    /// Free text search over name, group and context.
    Search {
        query: String,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
    /// One record by item id.
    Get { item_id: String },
}

/// Draws job progress on the terminal.
struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} (ETA: {eta})")
                .context("Invalid progress bar template")?
                .progress_chars("=> "),
        );
        Ok(Self { bar })
    }
}

impl ProgressObserver for BarObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.total_items as u64);
        self.bar.set_position(snapshot.position as u64);
        self.bar.set_message(format!(
            "{} ok, {} failed",
            snapshot.processed_items, snapshot.failed_items
        ));
        if snapshot.status != BatchJobStatus::Running {
            self.bar.finish_with_message(format!(
                "{}: {} ok, {} failed",
                snapshot.status, snapshot.processed_items, snapshot.failed_items
            ));
        }
    }
}

fn read_events(input: Option<&PathBuf>) -> Result<Vec<EventInput>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(EventInput::from_json_line(&line));
    }
    Ok(events)
}

fn print_record(record: &DerivedRecord) {
    println!(
        "{}  {:>8.2}  {} / {}{}  [{}]",
        record.item_id,
        record.score,
        record.name,
        record.group_key,
        if record.context.is_empty() {
            String::new()
        } else {
            format!(" / {}", record.context)
        },
        record.algorithm_version
    );
}

fn print_records(records: &[DerivedRecord]) {
    for record in records {
        print_record(record);
    }
    println!("{} records", records.len());
}

fn print_job(job: &BatchJob) {
    println!(
        "{}  {:<9}  {:<9}  {}/{} handled, {} processed, {} failed",
        job.job_id,
        job.job_type.as_str(),
        job.status.as_str(),
        job.position(),
        job.total_items,
        job.processed_items,
        job.failed_items
    );
    if let Some(reason) = &job.failure_reason {
        println!("    failure: {}", reason);
    }
}

fn order(asc: bool) -> SortOrder {
    if asc {
        SortOrder::Ascending
    } else {
        SortOrder::Descending
    }
}

fn parse_kind(kind: &str) -> Result<RollupKind> {
    RollupKind::parse(kind).with_context(|| format!("Unknown rollup kind {:?}", kind))
}

/// Builds a batch engine with a terminal progress bar and Ctrl-C wired to
/// the job's stop handle.
fn run_job(
    ledger: &Ledger,
    config: &AppConfig,
    prepare: impl FnOnce(&BatchEngine) -> profile_ledger::Result<JobRun>,
) -> Result<BatchJob> {
    let progress = Arc::new(ProgressHub::new());
    progress.add_observer(Arc::new(BarObserver::new()?));
    let enrichment = build_provider(&config.enrichment)?;
    let engine = ledger.batch_engine(
        Arc::new(PlayCountScorer),
        Some(enrichment),
        config.batch.clone(),
        progress,
    )?;

    for job_id in engine.recover_interrupted_jobs()? {
        warn!("Job {} was interrupted and is now paused", job_id);
    }

    let stop_slot: Arc<Mutex<Option<StopHandle>>> = Arc::new(Mutex::new(None));
    let handler_slot = stop_slot.clone();
    ctrlc::set_handler(move || {
        let slot = handler_slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            Some(handle) => handle.stop(),
            None => std::process::exit(130),
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    let run = prepare(&engine)?;
    *stop_slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(run.stop_handle());
    let job = engine.run(run)?;

    print_job(&job);
    match job.status {
        BatchJobStatus::Paused => {
            println!("Paused. Resume with: profile-ledger resume {}", job.job_id);
        }
        BatchJobStatus::Failed => {
            bail!(
                "Job {} failed: {}",
                job.job_id,
                job.failure_reason.as_deref().unwrap_or("unknown reason")
            );
        }
        _ => {}
    }
    Ok(job)
}

fn execute(ledger: &Ledger, config: &AppConfig, command: Command) -> Result<()> {
    match command {
        Command::Versions { action } => match action {
            VersionsCommand::Register {
                version_id,
                label,
                activate,
            } => {
                let version = AlgorithmVersion::new(
                    &version_id,
                    &label,
                    chrono::Utc::now().timestamp(),
                    activate,
                );
                ledger.registry.register(&version)?;
                println!("Registered {}{}", version_id, if activate { " (active)" } else { "" });
            }
            VersionsCommand::List => {
                for version in ledger.registry.list()? {
                    println!(
                        "{}  {}  {}{}",
                        version.version_id,
                        version.created_at,
                        version.label,
                        if version.is_active { "  [active]" } else { "" }
                    );
                }
            }
            VersionsCommand::Active => match ledger.registry.current_active()? {
                Some(version) if version.is_active => println!("{}", version.version_id),
                Some(version) => println!("{} (latest, not flagged active)", version.version_id),
                None => println!("No version registered"),
            },
        },

        Command::Ingest { input } => {
            let events = read_events(input.as_ref())?;
            info!("Read {} input lines", events.len());
            run_job(ledger, config, |engine| engine.prepare_ingest(events))?;
        }

        Command::Resume { job_id, input } => {
            let job = ledger
                .jobs
                .get(&job_id)?
                .with_context(|| format!("Job {} not found", job_id))?;
            match job.job_type {
                JobType::Ingest => {
                    let events = read_events(input.as_ref())?;
                    run_job(ledger, config, |engine| {
                        engine.prepare_resume_ingest(&job_id, events)
                    })?;
                }
                JobType::Recompute => {
                    run_job(ledger, config, |engine| engine.prepare_resume_recompute(&job_id))?;
                }
            }
        }

        Command::Recompute => {
            run_job(ledger, config, |engine| engine.prepare_recompute())?;
        }

        Command::Jobs { job_id, limit } => match job_id {
            Some(job_id) => {
                let job = ledger
                    .jobs
                    .get(&job_id)?
                    .with_context(|| format!("Job {} not found", job_id))?;
                print_job(&job);
                for entry in job.error_log.entries() {
                    println!("    {}  {}  {}: {}", entry.at, entry.marker, entry.kind, entry.message);
                }
            }
            None => {
                for job in ledger.jobs.list(limit)? {
                    print_job(&job);
                }
            }
        },

        Command::Rollup {
            kind,
            key,
            show,
            limit,
        } => {
            let kind = parse_kind(&kind)?;
            if let Some(key) = key {
                match ledger.rollups.recompute_profile(kind, &key)? {
                    Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                    None => println!("No records for {} {:?}", kind, key),
                }
            } else if show {
                for profile in ledger.rollups.list_profiles(kind, limit)? {
                    println!(
                        "{:>8.2}  {:>5} items  {}",
                        profile.weighted_score, profile.item_count, profile.key
                    );
                }
            } else {
                let summary = ledger.rollups.recompute_all()?;
                println!(
                    "Rebuilt {} group, {} tag and {} period profiles",
                    summary.groups, summary.tags, summary.periods
                );
            }
        }

        Command::Stats { refresh } => {
            let stats = match ledger.statistics.read()? {
                Some(stats) if !refresh => stats,
                _ => ledger.statistics.refresh()?,
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::Query { query } => match query {
            QueryCommand::Score { min, max, asc } => {
                print_records(&ledger.entities.query_by_score_range(min, max, order(asc))?);
            }
            QueryCommand::Field {
                field,
                min,
                max,
                asc,
            } => {
                print_records(
                    &ledger
                        .entities
                        .query_by_computed_field(&field, min, max, order(asc))?,
                );
            }
            QueryCommand::Time { start, end } => {
                print_records(&ledger.entities.query_by_time_range(start, end)?);
            }
            QueryCommand::Group { key, prefix, limit } => {
                let records = if prefix {
                    ledger.entities.get_by_group_prefix(&key, limit)?
                } else {
                    ledger.entities.get_by_group_key(&key)?
                };
                print_records(&records);
            }
            QueryCommand::Search { query, limit } => {
                print_records(&ledger.entities.search(&query, limit)?);
            }
            QueryCommand::Get { item_id } => {
                let item_id = ItemId::parse(&item_id)?;
                match ledger.entities.get_by_identifier(&item_id)? {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => println!("No record {}", item_id),
                }
            }
        },

        Command::Export { output } => {
            let snapshots = ledger.snapshots();
            let snapshot = match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {:?}", path))?;
                    snapshots.export_snapshot(BufWriter::new(file))?
                }
                None => snapshots.export_snapshot(std::io::stdout().lock())?,
            };
            info!("Exported {} records", snapshot.records.len());
        }

        Command::Import { input } => {
            let file =
                File::open(&input).with_context(|| format!("Failed to open {:?}", input))?;
            let summary = ledger.snapshots().import_snapshot(BufReader::new(file))?;
            println!(
                "Imported {} versions, {} records ({} rejected), {} profiles",
                summary.versions, summary.records_written, summary.records_rejected, summary.profiles
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        lastfm_api_key: cli_args.lastfm_api_key.clone(),
        chunk_size: cli_args.chunk_size,
        checkpoint_every: cli_args.checkpoint_every,
        scoring_workers: cli_args.scoring_workers,
        strict: cli_args.strict,
        strict_enrichment: cli_args.strict_enrichment,
        top_n: cli_args.top_n,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening ledger database at {:?}...", config.db_path);
    let ledger = Ledger::open(&config.db_path, config.statistics.clone())?;
    let result = execute(&ledger, &config, cli_args.command);
    ledger.close()?;
    result
}
