//! campus-backup
//!
//! Backup and restore of the campus LMS and ILS: databases, file sets,
//! configuration, shipped to tiered remote storage.

// campus-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod health;
mod restore;
mod services;
mod storage;
#[cfg(test)]
mod testing;
mod toolkit;
mod utils;

use clap::{ArgAction, Args, Parser, Subcommand};
use dialoguer::Select;
use dotenv::dotenv;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::{AppConfig, DEFAULT_CONFIG_PATH};
use errors::{AppError, Result};
use health::{Signals, supervise};
use restore::logic::RestoreOutcome;
use restore::prompt::TerminalOperator;
use restore::selection::Selector;
use restore::{ConfigChoice, RestoreRequest};
use storage::{Tier, render_listing};
use toolkit::Toolkit;
use utils::system::diagnostic_bundle;

#[derive(Parser, Debug)]
#[command(name = "campus-backup", version, about = "Backup and restore of the campus LMS and ILS")]
struct Cli {
    /// Path to config.json
    #[arg(long, global = true, env = "CAMPUS_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Full backup of both stores
    Backup(BackupArgs),
    /// Restore an archive over the live system
    Restore(RestoreArgs),
    /// Configuration utilities
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct BackupArgs {
    /// List archives in every tier and exit
    #[arg(long)]
    list: bool,

    /// Run the pre-flight checks only
    #[arg(long, conflicts_with = "list")]
    test: bool,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Newest archive of a tier (daily, weekly, monthly)
    #[arg(long, value_name = "TIER", conflicts_with_all = ["date", "list"])]
    latest: Option<Tier>,

    /// Archive whose name contains this date, in any tier
    #[arg(long, value_name = "YYYYMMDD", conflicts_with = "list")]
    date: Option<String>,

    /// List archives in every tier and exit
    #[arg(long)]
    list: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,

    /// Also restore configuration files
    #[arg(long, conflicts_with = "skip_config")]
    with_config: bool,

    /// Keep the live configuration files
    #[arg(long)]
    skip_config: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Load and validate the configuration, then print it without secrets
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.verbose, cli.quiet, None);
            tracing::error!("{}: {:#}", e.kind(), e);
            eprintln!("❌ Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.verbose, cli.quiet, Some(&config.log_file));

    match run_app(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Loads config.json, classifying failures as configuration errors.
fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_from_json(path).map_err(|e| match e.downcast::<AppError>() {
        Ok(app_error) => app_error,
        Err(other) => AppError::Config(format!("{:#}", other)),
    })
}

/// stderr plus an appended log file; the file feeds the failure diagnostics.
fn init_tracing(verbose: u8, quiet: bool, log_file: Option<&Path>) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,campus_backup={}", level)));

    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("⚠ Cannot open log file {}: {}", path.display(), e);
                None
            }
        }
    });
    let file_layer = file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

async fn run_app(command: Option<Commands>, config: &AppConfig) -> Result<()> {
    match command {
        Some(Commands::Backup(args)) => run_backup(args, config).await,
        Some(Commands::Restore(args)) => run_restore(args, config).await,
        Some(Commands::Config {
            action: ConfigAction::Check,
        }) => {
            println!("{}", config.describe());
            println!("✅ Configuration is valid.");
            Ok(())
        }
        None => interactive_menu(config).await,
    }
}

async fn run_backup(args: BackupArgs, config: &AppConfig) -> Result<()> {
    let tools = Toolkit::connect(config).await;
    if args.list {
        return list_archives(&tools).await;
    }
    if args.test {
        backup::run_backup_test(config, &tools).await?;
        println!("✅ Pre-flight checks passed; a backup would run.");
        return Ok(());
    }

    let now = chrono::Local::now().naive_local();
    let report = supervise(
        tools.monitor.as_ref(),
        Signals::Lifecycle,
        backup::run_backup_flow(config, &tools, now),
        |report| Some(report.summary()),
        |err| diagnose(err, config),
    )
    .await?;
    println!("✅ {}", report.summary());
    Ok(())
}

async fn run_restore(args: RestoreArgs, config: &AppConfig) -> Result<()> {
    let tools = Toolkit::connect(config).await;
    if args.list {
        return list_archives(&tools).await;
    }
    let selector = match (args.latest, args.date) {
        (Some(tier), _) => Some(Selector::Latest(tier)),
        (None, Some(date)) => Some(Selector::Date(date)),
        (None, None) => None,
    };
    let config_choice = if args.with_config {
        ConfigChoice::Restore
    } else if args.skip_config {
        ConfigChoice::Skip
    } else {
        ConfigChoice::Ask
    };
    let request = RestoreRequest {
        selector,
        assume_yes: args.yes,
        config: config_choice,
    };
    restore_with(config, &tools, &request).await
}

async fn restore_with(config: &AppConfig, tools: &Toolkit, request: &RestoreRequest) -> Result<()> {
    let now = chrono::Local::now().naive_local();
    let outcome = supervise(
        tools.monitor.as_ref(),
        Signals::FailureOnly,
        restore::run_restore_flow(config, tools, request, &TerminalOperator, now),
        |_| None,
        |err| diagnose(err, config),
    )
    .await?;
    match outcome {
        RestoreOutcome::Declined => println!("Restore cancelled; nothing was changed."),
        RestoreOutcome::Completed(report) => println!("✅ {}", report.summary()),
    }
    Ok(())
}

async fn list_archives(tools: &Toolkit) -> Result<()> {
    let archives = tools.store.list_all().await?;
    println!("{}", render_listing(&archives));
    Ok(())
}

fn diagnose(err: &AppError, config: &AppConfig) -> String {
    diagnostic_bundle(
        &format!("{}: {:#}", err.kind(), err),
        &config.log_file,
        &config.data_root,
    )
}

/// Shown when no subcommand is given.
async fn interactive_menu(config: &AppConfig) -> Result<()> {
    let items = [
        "Take backup",
        "Restore a backup",
        "List archives",
        "Check configuration",
        "Quit",
    ];
    let choice = Select::new()
        .with_prompt("Select an operation")
        .items(&items)
        .default(0)
        .interact_opt()
        .map_err(anyhow::Error::from)?;

    match choice {
        Some(0) => {
            run_backup(
                BackupArgs {
                    list: false,
                    test: false,
                },
                config,
            )
            .await
        }
        Some(1) => {
            let tools = Toolkit::connect(config).await;
            let request = RestoreRequest {
                selector: None,
                assume_yes: false,
                config: ConfigChoice::Ask,
            };
            restore_with(config, &tools, &request).await
        }
        Some(2) => list_archives(&Toolkit::connect(config).await).await,
        Some(3) => {
            println!("{}", config.describe());
            Ok(())
        }
        _ => Ok(()),
    }
}
