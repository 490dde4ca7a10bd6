use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "crm")]
#[command(version, about = "Pipeline and deal CRM: board client, REST backend and dashboard")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to crm.toml. Defaults to $CRM_HOME/crm.toml, then ./crm.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the REST API. Overrides client.api_url
    #[arg(long, global = true, env = "CRM_API_URL")]
    pub api_url: Option<String>,

    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the REST backend and the dashboard
    Serve {
        #[arg(long)]
        host: Option<String>,

        /// API port
        #[arg(short, long)]
        port: Option<u16>,

        /// Dashboard port
        #[arg(long)]
        dashboard_port: Option<u16>,

        /// Database path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Enable dev mode (built-in token secret, permissive CORS)
        #[arg(long)]
        dev: bool,

        /// Open the dashboard in a browser once listening
        #[arg(long)]
        open: bool,
    },
    /// Issue or inspect session tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
    /// Store a session token for later commands
    Login {
        /// The token itself
        #[arg(long, conflicts_with = "url")]
        token: Option<String>,

        /// A dashboard URL carrying ?token=, as left by the Notion sign-in
        #[arg(long)]
        url: Option<String>,
    },
    /// Forget the stored session token
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Manage pipelines and their stages
    Pipelines {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Manage deals
    Deals {
        #[command(subcommand)]
        command: DealCommands,
    },
    /// Manage contacts
    Contacts {
        #[command(subcommand)]
        command: ContactCommands,
    },
    /// Manage tags
    Tags {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// Show a pipeline as a board of stage columns
    Board {
        /// Pipeline id
        pipeline: i64,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TokenCommands {
    /// Create the user if needed and print a signed token (needs the server's secret)
    Issue {
        #[arg(long)]
        email: String,

        #[arg(long)]
        name: Option<String>,
    },
    /// Decode a token without checking its signature
    Inspect {
        /// Defaults to the stored token
        token: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PipelineCommands {
    List {
        #[arg(short, long)]
        search: Option<String>,

        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: u32,
    },
    Show {
        id: i64,
    },
    Create {
        name: String,

        /// Stage names in order
        #[arg(short, long, value_delimiter = ',', required = true)]
        stages: Vec<String>,
    },
    Rename {
        id: i64,
        name: String,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand, Clone)]
pub enum DealCommands {
    List {
        #[arg(long)]
        pipeline: Option<i64>,

        #[arg(long)]
        stage: Option<i64>,

        /// active, won or lost
        #[arg(long)]
        status: Option<String>,

        #[arg(short, long)]
        search: Option<String>,

        /// Fetch every page instead of one
        #[arg(long)]
        all: bool,
    },
    Create {
        name: String,

        #[arg(long)]
        pipeline: i64,

        /// Defaults to the pipeline's first stage
        #[arg(long)]
        stage: Option<i64>,

        #[arg(long, default_value = "0")]
        value: String,

        #[arg(long, default_value = "")]
        status: String,

        /// YYYY-MM-DD
        #[arg(long, default_value = "")]
        close_date: String,

        /// key=value, repeatable
        #[arg(long = "field")]
        fields: Vec<String>,
    },
    /// Move a deal to a stage of its pipeline
    Move {
        id: i64,

        #[arg(long)]
        stage: i64,

        /// Position within the stage (0 is the top)
        #[arg(long, default_value = "0")]
        position: i32,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand, Clone)]
pub enum ContactCommands {
    List {
        #[arg(short, long)]
        search: Option<String>,

        #[arg(long)]
        tag: Option<i64>,

        #[arg(long, default_value = "1")]
        page: u32,
    },
    Create {
        name: String,

        #[arg(long, default_value = "")]
        email: String,

        #[arg(long, default_value = "")]
        phone: String,

        #[arg(long, default_value = "")]
        company: String,

        #[arg(long = "tag")]
        tags: Vec<i64>,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand, Clone)]
pub enum TagCommands {
    List {
        #[arg(short, long)]
        search: Option<String>,
    },
    Create {
        name: String,

        /// #RRGGBB
        #[arg(long)]
        color: String,
    },
    Delete {
        id: i64,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = cmd::CliEnv::resolve(&cli)?;
    let _log_guard = env.init_logging(cli.verbose)?;

    match &cli.command {
        Commands::Serve {
            host,
            port,
            dashboard_port,
            db,
            dev,
            open,
        } => {
            let overrides = cmd::ServeOverrides {
                host: host.clone(),
                port: *port,
                dashboard_port: *dashboard_port,
                db: db.clone(),
                dev: *dev,
                open: *open,
            };
            cmd::cmd_serve(&env, overrides).await?;
        }
        Commands::Token { command } => cmd::cmd_token(&env, command.clone())?,
        Commands::Login { token, url } => cmd::cmd_login(&env, token.as_deref(), url.as_deref())?,
        Commands::Logout => cmd::cmd_logout(&env)?,
        Commands::Whoami => cmd::cmd_whoami(&env).await?,
        Commands::Pipelines { command } => cmd::cmd_pipelines(&env, command.clone()).await?,
        Commands::Deals { command } => cmd::cmd_deals(&env, command.clone()).await?,
        Commands::Contacts { command } => cmd::cmd_contacts(&env, command.clone()).await?,
        Commands::Tags { command } => cmd::cmd_tags(&env, command.clone()).await?,
        Commands::Board { pipeline } => cmd::cmd_board(&env, *pipeline).await?,
        Commands::Config { command } => cmd::cmd_config(&env, command.clone())?,
    }

    Ok(())
}
