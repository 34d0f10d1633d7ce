use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use mediascribe::config::load_config_or_default;
use mediascribe::db::{self, mount_repo, Database};
use mediascribe::dispatcher::{DispatchOptions, DispatchSummary, Dispatcher};
use mediascribe::engine::build_engine;
use mediascribe::error::ScribeError;
use mediascribe::paths::LogicalPath;
use mediascribe::transcript::{self, TranscriptFormat};
use mediascribe::verifier::verify_catalog;
use mediascribe::volume::{probe_for_host, MountSnapshot};
use mediascribe::worker::{run_worker_process, InlineRunner, ProcessRunner, TaskRunner};
use mediascribe::Config;

const EXIT_SETUP_FAILURE: u8 = 1;
const EXIT_NOT_AVAILABLE: u8 = 2;

#[derive(Parser)]
#[command(name = "mediascribe", version, about = "Transcribe media on removable volumes")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the config file (default: ~/.mediascribe/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe catalog entries that have no successful run yet
    Dispatch {
        /// Lowest catalog id to consider
        #[arg(long)]
        id_min: Option<i64>,
        /// Highest catalog id to consider
        #[arg(long)]
        id_max: Option<i64>,
        /// Stop after this many candidates
        #[arg(long)]
        limit: Option<usize>,
        /// Run the engine inside this process instead of one child per file
        #[arg(long)]
        in_process: bool,
    },
    /// List mounted volumes
    Mounts {
        /// Also record them in the mount history
        #[arg(long)]
        record: bool,
    },
    /// Print the logical path of a file
    Resolve { path: PathBuf },
    /// Print where a logical path is mounted right now
    Locate { volume: String, relative: String },
    /// Mark catalog entries whose file is gone as deleted
    Verify,
    /// Print the latest transcript of a catalog entry
    Export {
        file_id: i64,
        #[arg(long, default_value = "srt")]
        format: TranscriptFormat,
    },
    /// Run a single task from stdin (used by dispatch)
    #[command(hide = true)]
    Worker,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries command output and the worker reply
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records: {}", e);
    }
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, ScribeError> {
    if let Command::Worker = cli.command {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        run_worker_process(stdin.lock(), stdout.lock())?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Dispatch {
            id_min,
            id_max,
            limit,
            in_process,
        } => {
            let options = DispatchOptions {
                id_min,
                id_max,
                limit,
            };
            let summary = dispatch(config, options, in_process)?;
            print_summary(&summary);
            Ok(ExitCode::SUCCESS)
        }
        Command::Mounts { record } => {
            let snapshot = MountSnapshot::capture(probe_for_host().as_ref());
            for mount in snapshot.mounts() {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    mount.identity(),
                    mount.mount_path,
                    mount.device.as_deref().unwrap_or("-"),
                    mount.fs_type.as_deref().unwrap_or("-"),
                    mount.label.as_deref().unwrap_or("-"),
                );
            }
            if record {
                let catalog = open_catalog(&config)?;
                let inserted = mount_repo::upsert_all(
                    &catalog,
                    snapshot.mounts(),
                    &db::timestamp(Utc::now()),
                )?;
                info!("Recorded {} new mount(s)", inserted);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Resolve { path } => {
            let snapshot = MountSnapshot::capture(probe_for_host().as_ref());
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            match snapshot.to_logical(&path) {
                Some(logical) => {
                    println!("{}\t{}", logical.volume_identity, logical.relative_path);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("{} is not on a mounted volume", path.display());
                    Ok(ExitCode::from(EXIT_NOT_AVAILABLE))
                }
            }
        }
        Command::Locate { volume, relative } => {
            let snapshot = MountSnapshot::capture(probe_for_host().as_ref());
            match snapshot.to_physical(&LogicalPath::new(volume.clone(), &relative)) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("Volume {} is not mounted", volume);
                    Ok(ExitCode::from(EXIT_NOT_AVAILABLE))
                }
            }
        }
        Command::Verify => {
            let db = open_catalog(&config)?;
            let snapshot = MountSnapshot::capture(probe_for_host().as_ref());
            let report = verify_catalog(&db, &snapshot)?;
            println!(
                "checked {}, present {}, marked deleted {}, unavailable {}",
                report.checked, report.present, report.marked_deleted, report.unavailable
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Export { file_id, format } => {
            let db = open_catalog(&config)?;
            match transcript::latest_transcript(&db, file_id)? {
                Some((_, segments)) => {
                    print!("{}", transcript::render(&segments, format));
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("No transcript for file {}", file_id);
                    Ok(ExitCode::from(EXIT_NOT_AVAILABLE))
                }
            }
        }
        Command::Worker => Ok(ExitCode::SUCCESS),
    }
}

fn open_catalog(config: &Config) -> Result<Database, ScribeError> {
    let db = Database::open(&config.catalog.path)?;
    db.set_busy_timeout(config.catalog.statement_timeout())?;
    Ok(db)
}

fn dispatch(
    config: Config,
    options: DispatchOptions,
    in_process: bool,
) -> Result<DispatchSummary, ScribeError> {
    // Fail at setup rather than once per file
    let engine = build_engine(&config.engine)?;
    let db = open_catalog(&config)?;

    let runner: Arc<dyn TaskRunner> = if in_process {
        Arc::new(InlineRunner::new(Arc::from(engine)))
    } else {
        Arc::new(ProcessRunner::current_exe()?)
    };

    let dispatcher = Dispatcher::new(db, config, runner);
    let stop = dispatcher.stop_flag();
    if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
        warn!("Cannot install Ctrl-C handler: {}", e);
    }

    dispatcher.run(&options)
}

fn print_summary(summary: &DispatchSummary) {
    println!("selected:            {}", summary.selected);
    println!("submitted:           {}", summary.submitted);
    println!("succeeded:           {}", summary.succeeded);
    println!("partially succeeded: {}", summary.partially_succeeded);
    println!("failed:              {}", summary.failed);
    println!("already done:        {}", summary.already_done);
    println!("claimed elsewhere:   {}", summary.contended);
    println!("not mounted:         {}", summary.skipped.not_mounted);
    println!("non existing:        {}", summary.skipped.non_existing);
    println!("no audio:            {}", summary.skipped.no_audio);
    println!("duplicate content:   {}", summary.skipped.duplicate_content);
    if summary.unrecorded > 0 || summary.claim_errors > 0 {
        println!("unrecorded:          {}", summary.unrecorded);
        println!("claim errors:        {}", summary.claim_errors);
    }
    if summary.pool_broken {
        println!("pool broken, cancelled {}", summary.cancelled);
    }
    if summary.interrupted {
        println!("interrupted");
    }
}
