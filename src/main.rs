use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use drms::app::App;
use drms::config::ServerConfig;
use drms::exit::ExitStatus;
use drms::logging::{self, SessionLog};
use drms::server::ShellSyntax;
use drms::shutdown::{ControlSignals, WaitPolicy};

/// DRMS session server.
///
/// Holds one shared database transaction open for every module that connects
/// and commits it on SIGUSR1 or rolls it back on SIGINT, SIGQUIT or SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "drms_server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Database holding the shared transaction
    #[arg(long)]
    database: Option<PathBuf>,

    /// Do not use the serializable isolation level for this session
    #[arg(long)]
    no_share: bool,

    /// Announcement file prefix; the file is written to <PREFIX>.<pid>
    #[arg(long)]
    announce: Option<PathBuf>,

    /// Shell syntax of the announcement file
    #[arg(long, value_enum)]
    syntax: Option<ShellSyntax>,

    /// Whether to wait for active clients when the session is ending
    #[arg(long, value_enum)]
    wait: Option<WaitPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.listener.host = host.clone();
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(database) = &self.database {
            config.database.path = database.clone();
        }
        if self.no_share {
            config.database.no_share = true;
        }
        if let Some(prefix) = &self.announce {
            config.announce.prefix = prefix.clone();
        }
        if let Some(syntax) = self.syntax {
            config.announce.syntax = syntax;
        }
        if let Some(wait) = self.wait {
            config.shutdown.wait_for_clients = wait;
        }
        Ok(config)
    }
}

fn main() {
    let args = Args::parse();
    let log = SessionLog::new();
    logging::init(&args.log_level, &log);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            std::process::exit(ExitStatus::Abnormal.code());
        }
    };

    let status = match runtime.block_on(run(args, log)) {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("drms_server failed: {e:#}");
            ExitStatus::Abnormal
        }
    };
    tracing::info!(?status, code = status.code(), "drms_server exiting");
    std::process::exit(status.code());
}

async fn run(args: Args, log: SessionLog) -> anyhow::Result<ExitStatus> {
    let config = args.load_config()?;
    let user = std::env::var("USER").unwrap_or_else(|_| "drms".to_string());

    // Installed before the announcement exists; anything caught during
    // startup is delivered once the coordinator is running.
    let signals = ControlSignals::install().context("installing signal handlers")?;
    let app = App::new(config)
        .with_user(user)
        .with_session_log(log)
        .start()
        .await
        .context("starting session")?;
    let _signals = app.forward_signals(signals);

    Ok(app.wait().await)
}
