mod skill_commands;

use std::{path::PathBuf, process::ExitCode};

use {
    clap::{Parser, Subcommand},
    skillhub_config::{SkillhubConfig, ValidationLevel},
    skillhub_skills::ErrorKind,
    tracing::{debug, error},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "skillhub", version, about = "SkillHub: install and manage verified skill packages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (default: discovered skillhub.{toml,yaml,json}).
    #[arg(long, global = true, env = "SKILLHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Custom data directory (holds the default install dir and lockfile).
    #[arg(long, global = true, env = "SKILLHUB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Install directory (overrides config value).
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed skills.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show details about an installed skill.
    Info {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Check that every installed skill's entrypoint exists.
    Validate {
        #[arg(long)]
        json: bool,
    },
    /// Validate SKILL.md documents (files or skill directories).
    Check {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Validation level (default: from config).
        #[arg(long)]
        level: Option<ValidationLevel>,
    },
    /// List skills available in the remote index.
    ListRemote,
    /// Install a skill from the remote index.
    Install {
        slug: String,
        /// Install even when the index entry carries no sha256.
        #[arg(long)]
        allow_unverified: bool,
    },
    /// Install a skill directory from the local filesystem.
    InstallLocal { dir: PathBuf },
    /// Remove an installed skill.
    Uninstall { name: String },
    /// Package a skill directory as a zip and print its sha256.
    Pack {
        dir: PathBuf,
        /// Output directory (default: the skill directory's parent).
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SkillhubConfig> {
    if let Some(ref dir) = cli.data_dir {
        skillhub_config::set_data_dir(dir.clone());
    }
    let mut config = match cli.config {
        Some(ref path) => skillhub_config::load_config(path)?,
        None => skillhub_config::discover_and_load(),
    };
    if let Some(ref dir) = cli.install_dir {
        config.install_dir = Some(dir.clone());
    }
    Ok(config)
}

/// Exit status for a failed command, by error class.
fn exit_code(err: &anyhow::Error) -> u8 {
    let Some(err) = err.downcast_ref::<skillhub_skills::Error>() else {
        return 1;
    };
    match err.kind() {
        ErrorKind::Parse | ErrorKind::Validation => 65,
        ErrorKind::NotFound => 66,
        ErrorKind::Fetch => 69,
        ErrorKind::Io => 74,
        ErrorKind::Integrity | ErrorKind::PathTraversal => 76,
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    debug!(
        install_dir = %config.resolved_install_dir().display(),
        lockfile = %config.resolved_lockfile().display(),
        "resolved configuration"
    );

    match cli.command {
        Commands::List { json } => skill_commands::list(&config, json),
        Commands::Info { name, json } => skill_commands::info(&config, &name, json),
        Commands::Validate { json } => skill_commands::validate(&config, json),
        Commands::Check { paths, level } => {
            skill_commands::check(&paths, level.unwrap_or(config.validation))
        },
        Commands::ListRemote => skill_commands::list_remote(&config).await,
        Commands::Install {
            slug,
            allow_unverified,
        } => skill_commands::install(&config, &slug, allow_unverified).await,
        Commands::InstallLocal { dir } => skill_commands::install_local(&config, &dir).await,
        Commands::Uninstall { name } => skill_commands::uninstall(&config, &name).await,
        Commands::Pack { dir, out_dir } => skill_commands::pack(&dir, out_dir.as_deref()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        },
    }
}
