//! Conveyor - Entry Point
//!
//! Build, verify and deploy orchestrator. Without a mode flag the service
//! runs until SIGINT/SIGTERM; `--submit` and `--status` operate on the task
//! store of the data directory and exit.

use std::collections::HashMap;
use std::env;

use chrono::Utc;

use conveyor::app::options::AppOptions;
use conveyor::app::run::run;
use conveyor::deploy::runner::prepare_task;
use conveyor::errors::ConveyorError;
use conveyor::filesys::file::File;
use conveyor::logs::{init_logging, LogOptions};
use conveyor::storage::layout::StorageLayout;
use conveyor::storage::settings::Settings;
use conveyor::store::file::FileStore;
use conveyor::store::TaskStore;
use conveyor::utils::{parse_cli_args, version_info};
use conveyor_models::NewDeployTask;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli_args = parse_cli_args(env::args().skip(1));

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        print_json(&version);
        return;
    }

    let layout = match cli_args.get("data-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Submit a task and exit; a running service picks it up on its next sweep
    if cli_args.contains_key("submit") {
        if let Err(e) = submit(&layout, &cli_args).await {
            eprintln!("Failed to submit task: {e}");
            std::process::exit(1);
        }
        return;
    }

    // Print a task and exit
    if let Some(id) = cli_args.get("status") {
        if let Err(e) = status(&layout, id).await {
            eprintln!("Failed to read task: {e}");
            std::process::exit(1);
        }
        return;
    }

    // Run the service starting here

    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let settings = load_settings(&settings_file).await;

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: Some(layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    if let Err(e) = layout.logs_dir().create().await {
        println!("Failed to create log directory: {e}");
    }
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };
    if !settings_file.exists().await {
        warn!(
            "Settings file {} not found, using defaults",
            settings_file.path().display()
        );
    }

    let options = AppOptions::from_settings(&settings, layout);
    info!("Running Conveyor with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the service: {e}");
        std::process::exit(1);
    }
}

async fn load_settings(settings_file: &File) -> Settings {
    if !settings_file.exists().await {
        return Settings::default();
    }
    match settings_file.read_json::<Settings>().await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!(
                "Unable to read settings file {}: {e}",
                settings_file.path().display()
            );
            std::process::exit(1);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}

fn parse_id(args: &HashMap<String, String>, key: &str) -> Result<u64, ConveyorError> {
    match args.get(key) {
        None => Ok(0),
        Some(value) => value.parse().map_err(|_| {
            ConveyorError::ValidationError(format!("--{} must be a number, got {:?}", key, value))
        }),
    }
}

fn arg(args: &HashMap<String, String>, key: &str) -> String {
    args.get(key).cloned().unwrap_or_default()
}

fn file_store(layout: &StorageLayout) -> FileStore {
    FileStore::new(layout.tasks_dir(), layout.catalog_file())
}

async fn submit(
    layout: &StorageLayout,
    args: &HashMap<String, String>,
) -> Result<(), ConveyorError> {
    let new = NewDeployTask {
        project_id: parse_id(args, "project")?,
        env_id: parse_id(args, "env")?,
        cluster_id: parse_id(args, "cluster")?,
        namespace: arg(args, "namespace"),
        git_ref: args.get("git-ref").cloned(),
        build_job_name: arg(args, "job"),
        registry_project: arg(args, "registry-project"),
        image_name: arg(args, "image"),
        deployment_name: args.get("deployment").cloned(),
    };
    let task = prepare_task(new, Utc::now())?;

    layout.tasks_dir().create().await?;
    let task = file_store(layout).insert(task).await?;
    print_json(&task);
    Ok(())
}

async fn status(layout: &StorageLayout, id: &str) -> Result<(), ConveyorError> {
    let id = id
        .parse()
        .map_err(|_| ConveyorError::ValidationError(format!("invalid task id {:?}", id)))?;
    let task = file_store(layout).get(id).await?;
    print_json(&task);
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, waiting for Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
