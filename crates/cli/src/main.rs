mod chat;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use oncochat::client::{AuthTokenProvider, ChatRestClient, LoginOutcome};
use oncochat::config::{Config, Environment};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

#[derive(Parser)]
#[command(name = "oncochat")]
#[command(about = "OncoChat CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: ONCOCHAT_CONFIG_PATH or ~/.oncochat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (REST forwarding and chat socket proxy on one port).
    Gateway {
        /// Config file path (default: ONCOCHAT_CONFIG_PATH or ~/.oncochat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP and WebSocket port (default from config or 3000)
        #[arg(long, short)]
        port: Option<u16>,

        /// Read credentials from the HTTP-only auth cookie instead of the Authorization header.
        #[arg(long)]
        production: bool,
    },

    /// Log in through the gateway and store the development token.
    Login {
        /// Config file path (default: ONCOCHAT_CONFIG_PATH or ~/.oncochat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        email: String,
    },

    /// Log out and remove the stored token.
    Logout {
        /// Config file path (default: ONCOCHAT_CONFIG_PATH or ~/.oncochat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat with the symptom checker (interactive).
    Chat {
        /// Config file path (default: ONCOCHAT_CONFIG_PATH or ~/.oncochat/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Start a new conversation instead of resuming today's.
        #[arg(long)]
        new: bool,

        /// Account email; production mode logs in first since the auth cookie is not persisted.
        #[arg(long, short)]
        email: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("oncochat {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway {
            config,
            port,
            production,
        }) => {
            if let Err(e) = run_gateway(config, port, production).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Login { config, email }) => {
            if let Err(e) = run_login(config, email).await {
                log::error!("login failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Logout { config }) => {
            if let Err(e) = run_logout(config).await {
                log::error!("logout failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, new, email }) => {
            if let Err(e) = run_chat(config, new, email).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(oncochat::config::default_config_path);
    let dir = oncochat::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>, production: bool) -> anyhow::Result<()> {
    let (mut config, path) = oncochat::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if production {
        config.gateway.environment = Environment::Production;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    oncochat::gateway::run_gateway(config).await
}

pub(crate) type StdinLines = Lines<BufReader<Stdin>>;

pub(crate) fn stdin_lines() -> StdinLines {
    BufReader::new(tokio::io::stdin()).lines()
}

/// Print `label` and read one trimmed line; `None` at end of input.
pub(crate) async fn prompt(lines: &mut StdinLines, label: &str) -> anyhow::Result<Option<String>> {
    print!("{}", label);
    std::io::stdout().flush()?;
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

pub(crate) struct ClientContext {
    pub config: Config,
    pub rest: ChatRestClient,
    pub auth: Arc<AuthTokenProvider>,
}

fn client_context(config_path: Option<PathBuf>) -> anyhow::Result<ClientContext> {
    let (config, path) = oncochat::config::load_config(config_path)?;
    oncochat::init::require_initialized(&path)?;
    let auth = Arc::new(AuthTokenProvider::from_config(&config, &path));
    let rest = ChatRestClient::new(&config.client, auth.clone()).context("building REST client")?;
    Ok(ClientContext { config, rest, auth })
}

async fn run_login(config_path: Option<PathBuf>, email: String) -> anyhow::Result<()> {
    let ctx = client_context(config_path)?;
    let mut lines = stdin_lines();
    login(&ctx, &email, &mut lines).await?;
    if ctx.auth.environment().is_production() {
        println!("logged in; the auth cookie lives only in this process, use `oncochat chat --email` to chat");
    } else {
        println!("logged in; token stored at {}", ctx.auth.token_path().display());
    }
    Ok(())
}

/// Interactive login, including the forced password change. Stores the development token.
pub(crate) async fn login(ctx: &ClientContext, email: &str, lines: &mut StdinLines) -> anyhow::Result<()> {
    let password = prompt(lines, "Password: ")
        .await?
        .context("no password given")?;
    let tokens = match ctx.rest.login(email, &password).await? {
        LoginOutcome::Authenticated { tokens } => tokens,
        LoginOutcome::PasswordChangeRequired { session } => {
            println!("A new password is required for {}.", email);
            let new_password = prompt(lines, "New password: ")
                .await?
                .filter(|p| !p.is_empty())
                .context("no new password given")?;
            ctx.rest
                .complete_new_password(email, &new_password, &session)
                .await?
        }
        LoginOutcome::ChallengeRequired { .. } => {
            anyhow::bail!("this account requires an additional authentication challenge, which the CLI does not support")
        }
    };
    ctx.auth
        .store_token(&tokens.access_token)
        .context("storing auth token")?;
    log::info!("logged in as {}", email);
    Ok(())
}

async fn run_logout(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let ctx = client_context(config_path)?;
    if let Err(e) = ctx.rest.logout().await {
        log::warn!("gateway logout failed: {}", e);
    }
    println!("logged out");
    Ok(())
}

async fn run_chat(config_path: Option<PathBuf>, new: bool, email: Option<String>) -> anyhow::Result<()> {
    let ctx = client_context(config_path)?;
    let mut lines = stdin_lines();
    match (&email, ctx.auth.environment()) {
        (Some(email), _) => login(&ctx, email, &mut lines).await?,
        (None, Environment::Production) => {
            anyhow::bail!("production mode keeps the auth cookie in memory; pass --email to log in first")
        }
        (None, Environment::Development) => {}
    }
    chat::run(ctx, new, lines).await
}
