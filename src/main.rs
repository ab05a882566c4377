use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use svnlift::config::{CliOverrides, SvnliftConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "svnlift")]
#[command(version, about = "Migrate Subversion repositories to GitLab, one audited step at a time")]
pub struct Cli {
    /// Configuration file (defaults to .svnlift/svnlift.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Job database path. Overrides svnlift.toml and SVNLIFT_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the REST API
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (bind 0.0.0.0, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create a migration and run it in the foreground
    Migrate {
        /// Repository path under the Subversion root, e.g. legacy/app
        #[arg(long)]
        svn_group: String,

        /// Project directory holding trunk/branches/tags
        #[arg(long)]
        svn_project: String,

        /// Destination GitLab group full path
        #[arg(long)]
        gitlab_group: String,

        /// User to push as
        #[arg(long)]
        user: String,

        /// Password or access token to push with
        #[arg(long, env = "SVNLIFT_PUSH_PASSWORD", hide_env_values = true, default_value = "")]
        password: String,

        #[arg(long)]
        svn_url: Option<String>,

        #[arg(long)]
        gitlab_url: Option<String>,

        /// Parent directory of the job's scratch tree
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Files to strip from history (BFG --delete-files)
        #[arg(long)]
        clean_pattern: Option<String>,
    },
    /// Show a migration and its step history
    Status { id: i64 },
    /// Show how a Subversion repository is laid out
    Browse { repo: String },
    /// Create the job database
    InitDb,
    /// Mark jobs left RUNNING by a dead process as FAILED
    Reconcile,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn overrides(cli: &Cli) -> CliOverrides {
    let mut overrides = CliOverrides {
        db_path: cli.db_path.clone(),
        ..CliOverrides::default()
    };
    match &cli.command {
        Commands::Serve { port, .. } => overrides.port = *port,
        Commands::Migrate {
            svn_url,
            gitlab_url,
            work_dir,
            clean_pattern,
            ..
        } => {
            overrides.svn_url = svn_url.clone();
            overrides.gitlab_url = gitlab_url.clone();
            overrides.work_dir = work_dir.clone();
            overrides.clean_pattern = clean_pattern.clone();
        }
        _ => {}
    }
    overrides
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = SvnliftConfig::resolve(cli.config.as_deref(), &overrides(&cli))?;

    match &cli.command {
        Commands::Serve { dev, .. } => cmd::cmd_serve(&config, *dev).await?,
        Commands::Migrate {
            svn_group,
            svn_project,
            gitlab_group,
            user,
            password,
            ..
        } => {
            let request = svnlift::migration::models::NewMigration {
                svn_group: svn_group.clone(),
                svn_project: svn_project.clone(),
                gitlab_group: gitlab_group.clone(),
                user: user.clone(),
                password: password.clone(),
            };
            cmd::cmd_migrate(&config, request).await?;
        }
        Commands::Status { id } => cmd::cmd_status(&config, *id).await?,
        Commands::Browse { repo } => cmd::cmd_browse(&config, repo).await?,
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Reconcile => cmd::cmd_reconcile(&config).await?,
    }

    Ok(())
}
