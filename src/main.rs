//! # knowledge-sync CLI (`ksync`)
//!
//! Keeps a SQLite document store in step with GitLab repositories and Slack
//! channels, indexing only what changed since the last run.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ksync init` | Create the SQLite database and schema |
//! | `ksync sync [all\|gitlab\|slack]` | Incremental sync; `--full-reindex` starts over |
//! | `ksync status` | Show the persisted watermark of every instance |
//! | `ksync get <collection> <id>` | Print a stored document as JSON |
//! | `ksync completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! export GITLAB_PERSONAL_ACCESS_TOKEN=glpat-...
//! export SLACK_BOT_TOKEN=xoxb-...
//! ksync init --config ./config/ksync.toml
//! ksync sync all
//! ksync sync slack --full-reindex
//! RUST_LOG=debug ksync sync gitlab
//! ```

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use knowledge_sync::{config, get, ingest, migrate, status};

/// Incremental sync of GitLab and Slack content into a document store.
///
/// All commands except `completions` read a TOML configuration file.
/// Tokens are taken from `GITLAB_PERSONAL_ACCESS_TOKEN` and `SLACK_BOT_TOKEN`.
#[derive(Parser)]
#[command(
    name = "ksync",
    about = "Incremental sync of GitLab repositories and Slack channels into a document store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ksync.toml")]
    config: PathBuf,

    /// More log output on stderr (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress log output.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Sync sources into the document store.
    ///
    /// Incremental by default: each instance resumes from its stored
    /// watermark. Instances that fail are reported and skipped; their
    /// watermark stays where it was.
    Sync {
        /// `all`, `gitlab`, or `slack`.
        #[arg(default_value = "all")]
        source: String,

        /// Discard all stored watermarks and re-ingest everything.
        #[arg(long)]
        full_reindex: bool,
    },

    /// Show the stored watermark of every synced instance.
    Status,

    /// Print a stored document as JSON.
    Get {
        /// Collection name, e.g. `codebase_knowledge`.
        collection: String,
        /// Document id, e.g. `code:group/project:README.md`.
        id: String,
    },

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("info,sqlx=warn"),
            1 => EnvFilter::new("debug,sqlx=warn,hyper=info,reqwest=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "ksync", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            source,
            full_reindex,
        } => {
            ingest::run_sync(&cfg, &source, full_reindex).await?;
        }
        Commands::Status => {
            status::show_status(&cfg)?;
        }
        Commands::Get { collection, id } => {
            get::run_get(&cfg, &collection, &id).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
