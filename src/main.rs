//! rustbot - Main binary

use clap::Parser;
use rustbot_core::{
    launch_server_thread, server_thread_set, BotConfig, CredentialStore, Manager, Server,
    ServerState,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// A pluggable IRC client bot
#[derive(Parser)]
#[command(name = "rustbot")]
#[command(about = "An IRC client bot with dynamically loadable command plugins")]
#[command(version)]
struct Cli {
    /// Server hostname or address
    #[arg(short = 's', long = "server", default_value = "irc.libera.chat")]
    server: String,

    /// Server port
    #[arg(short = 'p', long = "port", default_value_t = 6667)]
    port: u16,

    /// Channel to join at startup
    #[arg(short = 'c', long = "channel", default_value = "##rustbot")]
    channel: String,

    /// Nickname
    #[arg(short = 'n', long = "nickname", default_value = "rustbot")]
    nickname: String,

    /// NickServ password; prompts on stdin when given without a value
    #[arg(short = 'x', long = "password", num_args = 0..=1, default_missing_value = "")]
    password: Option<String>,

    /// Use TLS (not yet supported)
    #[arg(short = 'l', long = "tls")]
    tls: bool,

    /// Credential store file mapping identities to capabilities
    #[arg(long = "users", value_name = "FILE")]
    users: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    if cli.tls {
        warn!("TLS is not yet supported, continuing in plaintext");
    }

    let password = match cli.password {
        Some(password) if password.is_empty() => prompt_password()?,
        Some(password) => password,
        None => String::new(),
    };

    let store = match &cli.users {
        Some(path) => CredentialStore::load(path)?,
        None => CredentialStore::default(),
    };

    let config = BotConfig {
        address: cli.server,
        port: cli.port,
        nickname: cli.nickname,
        password,
        channel: cli.channel,
        users_file: cli.users,
    };
    config.validate()?;

    let server = Server::connect(&config.address, config.port, &config.nickname, store)?;
    info!("connected to {}:{}", config.address, config.port);

    launch_server_thread(move || worker_main(server, config));
    server_thread_set().wait_all();

    info!("shutting down");
    Ok(())
}

/// Body of one connection worker.
fn worker_main(server: Server, config: BotConfig) {
    let mut manager = match Manager::new(server) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to set up worker: {e}");
            return;
        }
    };
    manager.ctx.server.set_state(ServerState::Connected);

    if let Err(e) = manager.ctx.server.login(&config.nickname, &config.password) {
        error!("login failed: {e}");
        manager.ctx.server.set_state(ServerState::Failed);
        return;
    }
    manager.ctx.server.set_state(ServerState::LoggedIn);

    if let Err(e) = manager.ctx.server.join_channel(&config.channel) {
        error!("failed to join {}: {e}", config.channel);
    }
    if let Err(e) = manager.ctx.server.send_channel(&config.channel, "Hello!") {
        error!("failed to greet {}: {e}", config.channel);
    }
    manager.ctx.server.dump_info();

    if let Err(e) = manager.run() {
        error!("worker exited with error: {e}");
        manager.ctx.server.set_state(ServerState::Failed);
    }
}

fn init_logging(level: &str) {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_names(true)
        .init();
}

fn prompt_password() -> anyhow::Result<String> {
    print!("Please enter your password: ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}
