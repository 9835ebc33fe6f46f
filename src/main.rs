use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use scr_ldx::ldx::{MergeEngine, MergeOutcome};
use scr_ldx::schema::FormRegistry;
use scr_ldx::server::{self, AppState};
use scr_ldx::storage::{self, Database};
use scr_ldx::telemetry::Telemetry;
use scr_ldx::watcher::{LdxWatcher, ScanReport};
use scr_ldx::{logging, Config};

#[derive(Parser)]
#[command(name = "scr-ldx")]
#[command(about = "Form values, LDX injection and live telemetry for the race team", version)]
#[command(after_help = "Without a subcommand the HTTP server and the watch loop are started.

Configuration is read from scr-ldx.toml (or --config) and overridden by
environment variables such as DATA_DIR, FORMS_DIR, LDX_WATCH_DIR and PORT.")]
struct Cli {
    /// Config file (default: ./scr-ldx.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the watch loop
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a single scan of the watch directory
    Scan,

    /// Inject current values into one file without marking it processed
    Merge {
        file: PathBuf,

        /// Show the tags that would be written, leave the file alone
        #[arg(long)]
        dry_run: bool,
    },

    /// List target files not processed yet
    Pending,

    /// Per-file injection counts
    Stats,

    /// Injection log of one target file
    Injections { file_name: String },

    /// Delete all form values, audit entries, processed files and injection logs
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

struct App {
    config: Arc<Config>,
    db: Arc<Database>,
    forms: Arc<FormRegistry>,
    watcher: Arc<LdxWatcher>,
}

impl App {
    fn bootstrap(config: Config) -> Result<Self> {
        let db = storage::open(&config.database_path())?;
        let forms = Arc::new(
            FormRegistry::load_dir(&config.forms_dir)
                .with_context(|| format!("failed to load forms from {}", config.forms_dir.display()))?,
        );
        let watcher = Arc::new(LdxWatcher::new(
            db.clone(),
            forms.clone(),
            config.watch_dir.clone(),
            config.extension.clone(),
            Duration::from_secs(config.scan_interval_secs),
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            forms,
            watcher,
        })
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let _log_guard = logging::init(config.log_dir.as_deref());

    let app = App::bootstrap(config)?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => serve(app, port).await?,

        Commands::Scan => {
            let report = app.watcher.scan_once().await;
            print_scan(&report);
        }

        Commands::Merge { file, dry_run } => merge(&app, &file, dry_run)?,

        Commands::Pending => {
            let pending = app.watcher.pending_files()?;
            if pending.is_empty() {
                println!("{}", "No pending files".bright_black());
            }
            for file in pending {
                println!(
                    "{} {} ({} bytes)",
                    "•".bright_blue(),
                    file.name.bright_white(),
                    file.size
                );
            }
        }

        Commands::Stats => {
            for stats in app.db.injection_stats()? {
                println!(
                    "{:<32} total {:>4}  {} {:>4}  {} {:>4}",
                    stats.file_name.bright_white(),
                    stats.total,
                    "updated".yellow(),
                    stats.updates,
                    "static".green(),
                    stats.static_count
                );
            }
        }

        Commands::Injections { file_name } => {
            for entry in app.db.injections_for_file(&file_name)? {
                let marker = if entry.was_update { "~".yellow() } else { "+".green() };
                println!(
                    "{} {} = {} {}",
                    marker,
                    entry.field_id.bright_white(),
                    entry.value,
                    entry.injected_at.format("%Y-%m-%d %H:%M:%S").to_string().bright_black()
                );
            }
        }

        Commands::Purge { yes } => {
            if !yes {
                println!("{} Refusing to purge without --yes", "✗".red());
                return Ok(());
            }
            app.db.purge()?;
            println!("{} All data cleared", "✓".green());
        }
    }

    Ok(())
}

async fn serve(app: App, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(app.config.port);
    println!(
        "{}",
        format!("Starting scr-ldx {} on port {}...", scr_ldx::VERSION, port)
            .cyan()
            .bold()
    );
    match app.watcher.watch_dir()? {
        Some(dir) => println!("{} Watching {}", "→".bright_blue(), dir.display().to_string().bright_yellow()),
        None => println!("{} No watch directory configured yet", "→".bright_blue()),
    }

    app.watcher.start();

    let state = AppState::new(
        app.db.clone(),
        app.forms.clone(),
        app.watcher.clone(),
        Telemetry::simulated(),
        app.config.clone(),
    );
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };
    let result = server::serve(state, port, shutdown).await;

    app.watcher.stop().await;
    println!("{} Stopped", "✓".green());
    result
}

fn merge(app: &App, file: &Path, dry_run: bool) -> Result<()> {
    let engine = MergeEngine::new(app.db.as_ref(), app.forms.as_ref());
    let outcome = if dry_run {
        engine.plan(file)?
    } else {
        engine.merge(file)?
    };
    print_outcome(&outcome, dry_run);
    Ok(())
}

fn print_outcome(outcome: &MergeOutcome, dry_run: bool) {
    let verb = if dry_run { "would write" } else { "wrote" };
    for entry in &outcome.entries {
        let marker = if entry.was_update { "~".yellow() } else { "+".green() };
        println!("{} {} = {}", marker, entry.field_id.bright_white(), entry.value);
    }
    for skipped in &outcome.skipped {
        println!(
            "{} {}.{} skipped: {}",
            "-".bright_black(),
            skipped.form_name,
            skipped.field_name,
            skipped.reason
        );
    }
    println!(
        "{} {} {} tags ({} updates)",
        "✓".green(),
        verb,
        outcome.entries.len(),
        outcome.updates()
    );
}

fn print_scan(report: &ScanReport) {
    let Some(dir) = &report.directory else {
        println!("{} Watch directory not configured or missing", "✗".red());
        return;
    };
    println!("{} Scanned {}", "→".bright_blue(), dir.display().to_string().bright_yellow());

    for done in &report.processed {
        println!(
            "{} {} ({} tags, {} updates, {} skipped)",
            "✓".green(),
            done.path.display(),
            done.injected,
            done.updates,
            done.skipped
        );
    }
    for failed in &report.failed {
        println!(
            "{} {} [{}] {}",
            "✗".red(),
            failed.path.display(),
            failed.category.to_string().yellow(),
            failed.message
        );
    }
    println!(
        "{} processed, {} already seen, {} failed",
        report.processed.len(),
        report.already_seen,
        report.failed.len()
    );
}
