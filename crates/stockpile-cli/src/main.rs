mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_MANIFEST_ERROR, EXIT_STORE_ERROR};
use stockpile_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stockpile",
    version,
    about = "Package inventory client for remote item repositories"
)]
struct Cli {
    /// Path to the Stockpile store directory.
    #[arg(long, default_value = "~/.local/share/stockpile", global = true)]
    store: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage configured repositories.
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Fetch and merge repository manifests.
    Update {
        /// Repository UUID (or prefix), title or address. Defaults to all enabled repositories.
        repo: Option<String>,
    },
    /// List items offered by the configured repositories.
    List {
        /// Only show installed items.
        #[arg(long, default_value_t = false)]
        installed: bool,
        /// Only show installed items with a newer version available.
        #[arg(long, default_value_t = false, conflicts_with = "installed")]
        updates: bool,
    },
    /// Show details of a single item.
    Show {
        /// Item identifier.
        item: String,
    },
    /// Download, verify and install an item.
    Install {
        /// Item identifier.
        item: String,
        /// Install from this repository instead of the one with the highest version.
        #[arg(long)]
        repo: Option<String>,
    },
    /// Remove an installed item.
    Uninstall {
        /// Item identifier.
        item: String,
    },
    /// Delete every cached package file that is not in use.
    ClearCache,
    /// Re-hash cached package files and report corruption.
    VerifyCache,
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Generate man pages into a directory.
    ManPages {
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum RepoCommands {
    /// Register a repository by manifest address.
    Add {
        /// URL of the repository manifest (http or https).
        address: String,
        /// Display title. Defaults to the manifest's own title after the first update.
        #[arg(long)]
        title: Option<String>,
        /// Bearer token sent with every request to this repository.
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove a repository and its items from the inventory.
    Remove {
        /// Repository UUID (or prefix), title or address.
        repo: String,
    },
    /// Include a repository in `stockpile update` again.
    Enable {
        /// Repository UUID (or prefix), title or address.
        repo: String,
    },
    /// Skip a repository when updating all repositories. Its items stay listed.
    Disable {
        /// Repository UUID (or prefix), title or address.
        repo: String,
    },
    /// List configured repositories.
    List,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STOCKPILE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let store_path = expand_tilde(&cli.store);
    let json_output = cli.json;
    let verbose = cli.verbose || cli.trace;

    let result = match cli.command {
        Commands::Repo { command } => match command {
            RepoCommands::Add {
                address,
                title,
                token,
            } => commands::repo::add(
                &store_path,
                &address,
                title.as_deref(),
                token.as_deref(),
                json_output,
            ),
            RepoCommands::Remove { repo } => {
                commands::repo::remove(&store_path, &repo, json_output)
            }
            RepoCommands::Enable { repo } => {
                commands::repo::set_enabled(&store_path, &repo, true, json_output)
            }
            RepoCommands::Disable { repo } => {
                commands::repo::set_enabled(&store_path, &repo, false, json_output)
            }
            RepoCommands::List => commands::repo::list(&store_path, json_output),
        },
        Commands::Update { repo } => {
            commands::update::run(&store_path, repo.as_deref(), json_output, verbose)
        }
        Commands::List { installed, updates } => {
            let filter = if updates {
                commands::list::Filter::Updates
            } else if installed {
                commands::list::Filter::Installed
            } else {
                commands::list::Filter::All
            };
            commands::list::run(&store_path, filter, json_output)
        }
        Commands::Show { item } => commands::show::run(&store_path, &item, json_output),
        Commands::Install { item, repo } => commands::install::run(
            &store_path,
            &item,
            repo.as_deref(),
            json_output,
            verbose,
        ),
        Commands::Uninstall { item } => {
            commands::uninstall::run(&store_path, &item, json_output, verbose)
        }
        Commands::ClearCache => commands::clear_cache::run(&store_path, json_output),
        Commands::VerifyCache => commands::verify_cache::run(&store_path, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:")
                || msg.starts_with("repository id changed")
            {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
