use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use kura::{
    Config,
    db::{Database, NewPlace},
    jobs::{JobQueue, JobWorker},
    reconcile::Reconciler,
    storage::PhotoStorage,
    thumbnails::ThumbnailEngine,
    upload::UploadPipeline,
    validation::Validator,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Global options that apply to all commands
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker and periodic reconciler (default if no command specified)
    Run {
        /// Automatically quit after specified number of seconds (useful for testing)
        #[arg(long)]
        quit_after: Option<u64>,
    },

    /// Run one reconciliation pass and print the report
    Reconcile {
        /// Report what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-enqueue thumbnail work for photos not marked completed, then drain it
    RetryThumbnails,

    /// Manage places
    #[command(subcommand)]
    Place(PlaceCommands),
}

#[derive(Subcommand, Debug)]
enum PlaceCommands {
    /// List all places
    List,
    /// Add a new place
    Add {
        name: String,
        #[arg(long, default_value = "")]
        location: String,
        #[arg(long, default_value = "")]
        country: String,
    },
    /// Remove a place and its stored photos
    Remove {
        /// Place id to remove
        id: i64,
    },
}

/// Everything a command needs, wired together once.
struct App {
    db: Arc<Database>,
    storage: PhotoStorage,
    pipeline: UploadPipeline,
    worker: JobWorker,
    rx: tokio::sync::mpsc::Receiver<kura::jobs::Job>,
    config: Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging first
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Some(Commands::Reconcile { dry_run, json }) => run_reconcile(config, dry_run, json).await,
        Some(Commands::RetryThumbnails) => retry_thumbnails(config).await,
        Some(Commands::Place(cmd)) => handle_place_command(config, cmd).await,
        Some(Commands::Run { quit_after }) => run(config, quit_after).await,
        None => run(config, None).await,
    }
}

fn load_config(path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config = toml_edit::de::from_str::<Config>(&content)?;
        info!("Configuration loaded from: {:?}", path);
        Ok(config)
    } else {
        info!("Config file not found at {:?}, using defaults", path);
        Ok(Config::default())
    }
}

fn build_app(config: Config) -> Result<App, Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open(&config.database.path)?);
    db.initialize()?;

    let storage = PhotoStorage::new(&config.storage.root);
    std::fs::create_dir_all(&config.storage.root)?;

    let (queue, rx) = JobQueue::new(&config.jobs);
    let engine = ThumbnailEngine::new(config.thumbnails.clone());
    let worker = JobWorker::new(
        db.clone(),
        storage.clone(),
        engine.clone(),
        queue.clone(),
        config.jobs.clone(),
    );
    let pipeline = UploadPipeline::new(
        db.clone(),
        storage.clone(),
        Validator::new(config.upload.clone()),
        engine,
        queue,
    );

    Ok(App {
        db,
        storage,
        pipeline,
        worker,
        rx,
        config,
    })
}

async fn run(config: Config, quit_after: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting {}", config.app.name);
    info!("Database: {:?}", config.database.path);
    info!("Storage root: {:?}", config.storage.root);

    let app = build_app(config)?;

    let worker_handle = tokio::spawn(app.worker.run(app.rx));

    // Anything left pending or processing from a previous run goes back on
    // the queue.
    match app.pipeline.retry_stuck_thumbnails() {
        Ok(0) => {}
        Ok(n) => info!("Recovered {} unfinished thumbnail job(s) at startup", n),
        Err(e) => tracing::error!("Startup thumbnail recovery failed: {}", e),
    }

    let reconciler = Arc::new(Reconciler::new(
        app.db.clone(),
        app.storage.clone(),
        app.config.reconciler.clone(),
        Duration::from_secs(app.config.thumbnails.lock_timeout_secs),
    ));
    let reconciler_handle = reconciler.start_periodic();

    shutdown_signal(quit_after).await;

    info!("Shutting down");
    if let Some(handle) = reconciler_handle {
        handle.abort();
    }
    // Dropping the pipeline releases the last queue sender; the worker exits
    // once the remaining jobs are drained.
    drop(app.pipeline);
    worker_handle.await?;
    Ok(())
}

async fn run_reconcile(
    config: Config,
    dry_run: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open(&config.database.path)?);
    db.initialize()?;
    let storage = PhotoStorage::new(&config.storage.root);
    let reconciler = Reconciler::new(
        db,
        storage,
        config.reconciler.clone(),
        Duration::from_secs(config.thumbnails.lock_timeout_secs),
    );

    let report = reconciler.run(dry_run).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if dry_run {
        println!("Dry run: {}", report);
    } else {
        println!("{}", report);
    }
    Ok(())
}

async fn retry_thumbnails(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_app(config)?;
    let enqueued = app.pipeline.retry_stuck_thumbnails()?;
    println!("Re-enqueued {} thumbnail job(s)", enqueued);

    // Drop every queue sender so the worker exits once the backlog drains.
    drop(app.pipeline);
    app.worker.run(app.rx).await;
    Ok(())
}

async fn handle_place_command(
    config: Config,
    cmd: PlaceCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_app(config)?;
    match cmd {
        PlaceCommands::List => {
            let places = app.db.list_places()?;
            if places.is_empty() {
                println!("No places");
            } else {
                for place in places {
                    println!("  {} [{}] {}", place.id, place.slug, place.name);
                }
            }
        }
        PlaceCommands::Add {
            name,
            location,
            country,
        } => {
            let place = app.db.create_place(&NewPlace {
                name: name.trim().to_string(),
                location: location.trim().to_string(),
                country: country.trim().to_string(),
                ..Default::default()
            })?;
            println!("Added place {} with slug '{}'", place.id, place.slug);
        }
        PlaceCommands::Remove { id } => {
            app.pipeline.delete_place(id)?;
            println!("Removed place {}", id);
        }
    }
    Ok(())
}

async fn shutdown_signal(quit_after: Option<u64>) {
    use tokio::signal;
    use tokio::time::sleep;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let quit_timer = async {
        if let Some(seconds) = quit_after {
            info!("Will automatically shut down after {} seconds", seconds);
            sleep(Duration::from_secs(seconds)).await;
            info!("Quit timer expired, shutting down");
        } else {
            std::future::pending::<()>().await
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        },
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        },
        _ = quit_timer => {},
    }
}
