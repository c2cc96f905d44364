//! snapforge - Image Activation CLI
//!
//! Drives the activation pipeline for container-image tarballs: fetch from
//! the object store, validate and extract, materialize a thin device, and
//! activate a copy-on-write snapshot.
//!
//! ## Usage
//!
//! ```sh
//! snapforge activate <key>
//! snapforge list
//! snapforge cleanup --all | --image <key> | --orphaned
//! ```
//!
//! Configuration comes from `SNAPFORGE_CONFIG` (JSON) and `SNAPFORGE_*`
//! environment variables; see the crate documentation for the full set.

use snapforge::{
    cleanup_all, cleanup_image, cleanup_orphaned, ActivationMachine, ActivationRequest,
    ActivationResponse, Config, Engine, EngineOptions, ImageRegistry, RunStatus, S3Store,
    Validator,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Activate { key: String },
    List,
    Cleanup { target: CleanupTarget },
    Version,
    Help,
}

#[derive(Debug)]
enum CleanupTarget {
    All,
    Image(String),
    Orphaned,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "activate" => {
            if args.len() < 3 {
                return Err("activate requires <key>".to_string());
            }
            Ok(Command::Activate {
                key: args[2].clone(),
            })
        }
        "list" => Ok(Command::List),
        "cleanup" => {
            let mut target = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--all" => {
                        target = Some(CleanupTarget::All);
                        i += 1;
                    }
                    "--image" => {
                        if i + 1 < args.len() {
                            target = Some(CleanupTarget::Image(args[i + 1].clone()));
                            i += 2;
                        } else {
                            return Err("--image requires a key".to_string());
                        }
                    }
                    "--orphaned" => {
                        target = Some(CleanupTarget::Orphaned);
                        i += 1;
                    }
                    other => return Err(format!("unknown cleanup flag: {}", other)),
                }
            }
            match target {
                Some(target) => Ok(Command::Cleanup { target }),
                None => Err("cleanup requires --all, --image <key>, or --orphaned".to_string()),
            }
        }
        "version" | "--version" | "-V" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command: {}", other)),
    }
}

fn print_help() {
    println!(
        "snapforge {}\n\
         \n\
         USAGE:\n\
         \x20   snapforge activate <key>       Fetch, validate and activate an image\n\
         \x20   snapforge list                 List images and their status\n\
         \x20   snapforge cleanup --all        Release resources for every image\n\
         \x20   snapforge cleanup --image <k>  Release resources for one image\n\
         \x20   snapforge cleanup --orphaned   Remove untracked work-dir entries\n\
         \x20   snapforge version              Print version",
        env!("CARGO_PKG_VERSION")
    );
}

// =============================================================================
// Commands
// =============================================================================

async fn run_activate(cfg: &Config, key: &str) -> snapforge::Result<()> {
    let registry = Arc::new(ImageRegistry::open(&cfg.registry_path)?);
    let store = Arc::new(
        S3Store::new(
            cfg.object_store.endpoint.as_deref(),
            &cfg.object_store.bucket,
            &cfg.object_store.region,
        )
        .await,
    );
    let validator = Arc::new(Validator::new(
        cfg.max_file_size,
        cfg.max_total_size,
        cfg.max_compression_ratio,
    ));
    let manager = snapforge::new_manager(&cfg.pool_name, cfg.dm_enabled).await?;

    let machine = ActivationMachine::new(
        registry,
        store,
        validator,
        manager,
        cfg.work_dir.clone(),
        cfg.max_retries,
    );
    let engine = Engine::new(&cfg.engine_db_path, machine.chain(), EngineOptions::default())?;

    let request = ActivationRequest {
        key: key.to_string(),
        bucket: cfg.object_store.bucket.clone(),
    };
    let version = engine.start(key, request, ActivationResponse::default())?;
    tracing::info!(version = %version, "activation run started");

    let outcome = engine.wait(&version).await?;
    match outcome.status {
        RunStatus::Complete => {
            println!(
                "activated: key={} status={} device={} snapshot={}",
                key,
                outcome.response.status,
                outcome.response.device_path.as_deref().unwrap_or("-"),
                outcome
                    .response
                    .snapshot_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
            Ok(())
        }
        _ => Err(snapforge::Error::Engine(
            outcome
                .error
                .unwrap_or_else(|| "activation failed".to_string()),
        )),
    }
}

fn run_list(cfg: &Config) -> snapforge::Result<()> {
    let registry = ImageRegistry::open(&cfg.registry_path)?;
    let images = registry.list()?;

    if images.is_empty() {
        println!("No images found");
        return Ok(());
    }

    println!(
        "{:<40} {:<12} {:<30} {:<10}",
        "KEY", "STATUS", "DEVICE", "SNAPSHOT"
    );
    println!("{}", "-".repeat(94));
    for image in &images {
        println!(
            "{:<40} {:<12} {:<30} {:<10}",
            image.key,
            image.status.to_string(),
            image.device_path.as_deref().unwrap_or("-"),
            image
                .snapshot_id
                .filter(|id| *id != 0)
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

async fn run_cleanup(cfg: &Config, target: CleanupTarget) -> snapforge::Result<()> {
    let registry = ImageRegistry::open(&cfg.registry_path)?;
    let manager = snapforge::new_manager(&cfg.pool_name, cfg.dm_enabled).await?;

    match target {
        CleanupTarget::All => {
            let cleaned = cleanup_all(&registry, &manager, &cfg.work_dir).await?;
            println!("cleaned {} images", cleaned);
        }
        CleanupTarget::Image(key) => {
            let image = registry
                .get_by_key(&key)?
                .ok_or(snapforge::Error::NotFound { id: 0 })?;
            cleanup_image(&registry, &manager, &cfg.work_dir, &image).await?;
            println!("cleaned: {}", key);
        }
        CleanupTarget::Orphaned => {
            let removed = cleanup_orphaned(&registry, &cfg.work_dir).await?;
            println!("removed {} orphaned resources", removed);
        }
    }
    Ok(())
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {}", message);
            print_help();
            return ExitCode::FAILURE;
        }
    };

    if matches!(command, Command::Help) {
        print_help();
        return ExitCode::SUCCESS;
    }
    if matches!(command, Command::Version) {
        println!("snapforge {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let cfg = match Config::load().and_then(|cfg| {
        cfg.validate()?;
        Ok(cfg)
    }) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        Command::Activate { key } => run_activate(&cfg, &key).await,
        Command::List => run_list(&cfg),
        Command::Cleanup { target } => run_cleanup(&cfg, target).await,
        Command::Help | Command::Version => unreachable!("handled above"),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
