//! Ghostgres template tool
//!
//! Freezes initialized PostgreSQL clusters as templates and materializes
//! clones of them, so test suites can skip `initdb`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ghostgres::{ConfigOpt, PostgresCluster, TemplateStore, test_config_with_logging};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(name = "ghostgres")]
#[command(about = "Manage PostgreSQL cluster templates for tests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing the PostgreSQL binaries
    #[arg(short, long, global = true)]
    bin_dir: Option<PathBuf>,

    /// Directory holding the templates
    #[arg(short = 'r', long, global = true)]
    template_root: Option<PathBuf>,

    /// Template name
    #[arg(short, long, global = true)]
    template: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a fresh cluster and save it as a template
    Freeze,

    /// Copy a template into a directory
    Clone {
        /// Destination data directory; must not exist
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Start a temporary clone of a template until Ctrl-C
    Run,

    /// Delete a template
    Delete,

    /// Show the server version and the templates available for it
    Status,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)
                .with_context(|| format!("Failed to load settings from {:?}", path))?,
            None => Settings::default(),
        };
        settings.apply_env();

        if let Some(dir) = &self.bin_dir {
            settings.bin_dir = dir.clone();
        }
        if let Some(root) = &self.template_root {
            settings.template_root = Some(root.clone());
        }
        if let Some(name) = &self.template {
            settings.template_name = name.clone();
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let settings = cli.settings()?;
    let store = TemplateStore::for_server(settings.template_root(), &settings.bin_dir)
        .await
        .context("Failed to detect postgres version")?;
    let name = settings.template_name.as_str();

    match cli.command {
        Commands::Freeze => {
            if store.exists(name) {
                println!(
                    "Template {} already exists for postgres {}",
                    name.bold(),
                    store.version()
                );
                return Ok(());
            }

            let scratch = tempfile::Builder::new()
                .prefix("ghostgres_freeze")
                .tempdir()
                .context("Failed to create working directory")?;
            let mut cluster = PostgresCluster::new(scratch.path().join("data"), &settings.bin_dir)
                .with_config(test_config_with_logging())
                .with_init_opts(vec![ConfigOpt::flag("--nosync")])
                .with_password(settings.password.clone());

            cluster.init().await.context("Failed to initialize cluster")?;
            let id = store
                .freeze(&cluster, name)
                .await
                .context("Failed to freeze template")?;
            println!("{} {:?}", "Frozen".green(), id.path());
        }

        Commands::Clone { dest } => {
            let cluster = store
                .from_template(name, Some(dest.as_path()))
                .await
                .with_context(|| format!("Failed to clone template {}", name))?;
            println!("{} {:?}", "Cloned".green(), cluster.data_dir);
        }

        Commands::Run => {
            let mut cluster = store
                .from_template(name, None)
                .await
                .with_context(|| format!("Failed to clone template {}", name))?;
            cluster.start().await.context("Failed to start postgres")?;
            cluster
                .wait_till_running(settings.startup_timeout())
                .await
                .context("postgres did not come up")?;

            println!("{}", cluster.connect_string().cyan());
            info!("Press Ctrl-C to stop");

            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("Failed to listen for Ctrl-C")?;
                    info!("Stopping postgres");
                    cluster.stop().await.context("Failed to stop postgres")?;
                }
                res = cluster.wait() => {
                    warn!("postgres exited on its own");
                    res.context("postgres failed")?;
                }
            }
        }

        Commands::Delete => {
            store
                .delete(name)
                .await
                .with_context(|| format!("Failed to delete template {}", name))?;
            println!("{} {}", "Deleted".green(), name);
        }

        Commands::Status => {
            let id = store.identity(name)?;
            let state = if id.exists() {
                "present".green()
            } else {
                "missing".red()
            };
            println!("{} {}", "postgres".bold(), store.version());
            println!("{} {:?} ({})", "template".bold(), id.path(), state);

            let names = store.list().await.context("Failed to list templates")?;
            println!("{} {}", "available".bold(), names.len());
            for template in names {
                println!("  {}", template);
            }
        }
    }

    Ok(())
}
