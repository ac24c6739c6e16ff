use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facesort_core::{ClusterId, FaceAnalyzer, Metric, OnnxAnalyzer};
use facesort_scan::{CancelToken, Config, ScanOptions, ScanReport, Scanner};
use facesort_store::{database_path, Database, DbScope, StoreError};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facesort", version, about = "Group the faces in a photo folder by identity")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a folder and print one record per face as JSON
    Scan {
        folder: PathBuf,
        /// Database file (overrides the configured scope)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Clustering distance threshold
        #[arg(long)]
        threshold: Option<f32>,
        /// Number of detection worker threads
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        metric: Option<Metric>,
        /// Drop detections below this confidence
        #[arg(long)]
        min_confidence: Option<f32>,
        /// Directory holding det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Where the folder database lives when --db is not given
        #[arg(long)]
        db_scope: Option<DbScope>,
    },
    /// Name a face cluster
    SetLabel {
        cluster_id: i64,
        name: String,
        #[command(flatten)]
        target: DbTarget,
        /// Store as a suggestion; never replaces a user-confirmed name
        #[arg(long)]
        suggest: bool,
    },
    /// Show the name of a face cluster
    GetLabel {
        cluster_id: i64,
        #[command(flatten)]
        target: DbTarget,
    },
    /// Merge two clusters; the lower id survives
    Merge {
        a: i64,
        b: i64,
        #[command(flatten)]
        target: DbTarget,
    },
    /// List clusters with their labels and aliases
    Clusters {
        #[command(flatten)]
        target: DbTarget,
    },
    /// Show recent scans
    History {
        #[command(flatten)]
        target: DbTarget,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete and recreate an unusable database
    Rebuild {
        #[command(flatten)]
        target: DbTarget,
    },
}

/// Which database a command operates on.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct DbTarget {
    /// Scanned folder; its database is located by the configured scope
    #[arg(long)]
    folder: Option<PathBuf>,
    /// Database file
    #[arg(long)]
    db: Option<PathBuf>,
}

impl DbTarget {
    fn resolve(&self, config: &Config) -> Result<PathBuf> {
        match (&self.db, &self.folder) {
            (Some(db), _) => Ok(db.clone()),
            (None, Some(folder)) => locate(folder, config.db_scope, config),
            (None, None) => anyhow::bail!("either --folder or --db is required"),
        }
    }

    fn open(&self, config: &Config) -> Result<Database> {
        let path = self.resolve(config)?;
        Ok(Database::open_existing(&path)?)
    }
}

#[derive(Serialize)]
struct LabelOutput {
    cluster_id: ClusterId,
    name: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<StoreError>() {
                Some(StoreError::ClusterNotFound(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let mut config = Config::load()?;

    match command {
        Commands::Scan { folder, db, threshold, workers, metric, min_confidence, model_dir, db_scope } => {
            if let Some(threshold) = threshold {
                config.threshold = threshold;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(metric) = metric {
                config.metric = metric;
            }
            if let Some(min_confidence) = min_confidence {
                config.min_confidence = min_confidence;
            }
            if let Some(model_dir) = model_dir {
                config.model_dir = model_dir;
            }
            if let Some(db_scope) = db_scope {
                config.db_scope = db_scope;
            }
            config.validate()?;

            let db_path = match db {
                Some(path) => path,
                None => locate(&folder, config.db_scope, &config)?,
            };
            let report = scan(folder, db_path, config).await?;
            print_json(&report.records)
        }
        Commands::SetLabel { cluster_id, name, target, suggest } => {
            let mut db = target.open(&config)?;
            let id = ClusterId(cluster_id);
            let canonical = if suggest {
                let canonical = db.resolve(id)?.ok_or(StoreError::ClusterNotFound(id))?;
                if !db.suggest_label(canonical, &name)? {
                    tracing::info!(cluster = %canonical, "cluster already has a confirmed label; suggestion ignored");
                }
                canonical
            } else {
                db.set_label(id, &name)?
            };
            let label = db.get_label(canonical)?;
            print_json(&LabelOutput { cluster_id: canonical, name: label.map(|l| l.name) })
        }
        Commands::GetLabel { cluster_id, target } => {
            let db = target.open(&config)?;
            let id = ClusterId(cluster_id);
            let canonical = db.resolve(id)?.unwrap_or(id);
            let label = db.get_label(id)?;
            print_json(&LabelOutput { cluster_id: canonical, name: label.map(|l| l.name) })
        }
        Commands::Merge { a, b, target } => {
            let mut db = target.open(&config)?;
            let outcome = db.merge_clusters(ClusterId(a), ClusterId(b))?;
            print_json(&outcome)
        }
        Commands::Clusters { target } => {
            let db = target.open(&config)?;
            print_json(&db.cluster_summaries()?)
        }
        Commands::History { target, limit } => {
            let db = target.open(&config)?;
            print_json(&db.scan_history(limit)?)
        }
        Commands::Rebuild { target } => {
            let path = target.resolve(&config)?;
            Database::rebuild(&path)?;
            tracing::info!(path = %path.display(), "database rebuilt");
            print_json(&serde_json::json!({ "rebuilt": path }))
        }
    }
}

/// Run a scan on a blocking thread; Ctrl-C cancels it between images.
async fn scan(folder: PathBuf, db_path: PathBuf, config: Config) -> Result<ScanReport> {
    let cancel = CancelToken::new();
    let mut task = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || -> Result<ScanReport> {
            let analyzers = (0..config.workers)
                .map(|_| {
                    OnnxAnalyzer::load(&config.model_dir, config.min_confidence)
                        .map(|a| Box::new(a) as Box<dyn FaceAnalyzer>)
                })
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
            tracing::info!(workers = analyzers.len(), model_dir = %config.model_dir.display(), "models loaded");

            let mut scanner = Scanner::new(analyzers, ScanOptions::from(&config))?;
            let mut db = Database::open(&db_path)?;
            Ok(scanner.scan(&folder, &mut db, &cancel)?)
        }
    });

    tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received; stopping after the current image");
            cancel.cancel();
            task.await?
        }
    }
}

fn locate(folder: &Path, scope: DbScope, config: &Config) -> Result<PathBuf> {
    database_path(folder, scope, &config.data_dir)
        .with_context(|| format!("cannot resolve folder {}", folder.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}
